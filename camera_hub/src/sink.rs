//! Event notification sink.
//!
//! Database clients are external collaborators; they appear here only as
//! the [`EventSink`] trait. The process carries exactly one sink instance
//! behind a mutex, mirroring the single query-path lock the SQL layer
//! needs, and every camera clones the [`SharedSink`] handle.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;
use std::sync::{Arc, Mutex};

use vigil_detection::frame::Timestamp;

/// File classes reported to the sink; the numeric ids feed the `%n`
/// filename specifier and the SQL layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    ImageSnapshot,
    ImageMotion,
    Movie,
    MovieMotion,
    MovieTimelapse,
}

impl FileKind {
    pub fn id(self) -> u32 {
        match self {
            FileKind::Image => 1,
            FileKind::ImageSnapshot => 2,
            FileKind::ImageMotion => 4,
            FileKind::Movie => 8,
            FileKind::MovieMotion => 16,
            FileKind::MovieTimelapse => 32,
        }
    }
}

/// Callbacks announcing event boundaries and file activity. Implementors
/// own their reconnect state; calls must not block the camera loop longer
/// than a single query.
pub trait EventSink: Send {
    fn on_event_start(&mut self, camera_id: u32, event_id: u64, time: Timestamp);
    fn on_event_end(&mut self, camera_id: u32, event_id: u64, time: Timestamp);
    fn on_file_created(&mut self, camera_id: u32, path: &Path, kind: FileKind, time: Timestamp);
    fn on_file_closed(&mut self, camera_id: u32, path: &Path, kind: FileKind, time: Timestamp);
    fn on_file_error(&mut self, camera_id: u32, path: &Path, reason: &str);
}

/// Default sink: structured log lines only.
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event_start(&mut self, camera_id: u32, event_id: u64, _time: Timestamp) {
        info!("[cam {camera_id}] event {event_id} started");
    }

    fn on_event_end(&mut self, camera_id: u32, event_id: u64, _time: Timestamp) {
        info!("[cam {camera_id}] event {event_id} ended");
    }

    fn on_file_created(&mut self, camera_id: u32, path: &Path, kind: FileKind, _time: Timestamp) {
        info!("[cam {camera_id}] created {:?} ({:?})", path, kind);
    }

    fn on_file_closed(&mut self, camera_id: u32, path: &Path, kind: FileKind, _time: Timestamp) {
        info!("[cam {camera_id}] closed {:?} ({:?})", path, kind);
    }

    fn on_file_error(&mut self, camera_id: u32, path: &Path, reason: &str) {
        error!("[cam {camera_id}] file error on {:?}: {reason}", path);
    }
}

/// Process-wide sink handle. The mutex serialises the underlying client's
/// single-shot query path across all cameras.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<Box<dyn EventSink>>>,
}

impl SharedSink {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        SharedSink {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn event_start(&self, camera_id: u32, event_id: u64, time: Timestamp) {
        if let Ok(mut s) = self.inner.lock() {
            s.on_event_start(camera_id, event_id, time);
        }
    }

    pub fn event_end(&self, camera_id: u32, event_id: u64, time: Timestamp) {
        if let Ok(mut s) = self.inner.lock() {
            s.on_event_end(camera_id, event_id, time);
        }
    }

    pub fn file_created(&self, camera_id: u32, path: &Path, kind: FileKind, time: Timestamp) {
        if let Ok(mut s) = self.inner.lock() {
            s.on_file_created(camera_id, path, kind, time);
        }
    }

    pub fn file_closed(&self, camera_id: u32, path: &Path, kind: FileKind, time: Timestamp) {
        if let Ok(mut s) = self.inner.lock() {
            s.on_file_closed(camera_id, path, kind, time);
        }
    }

    pub fn file_error(&self, camera_id: u32, path: &Path, reason: &str) {
        if let Ok(mut s) = self.inner.lock() {
            s.on_file_error(camera_id, path, reason);
        }
    }
}
