//! Time-lapse recording, orthogonal to motion events.
//!
//! Every `timelapse_interval` seconds the newest frame is appended to the
//! time-lapse movie. Rollover depends on the mode: daily/hourly modes roll
//! when the expanded filename changes, per-event mode rolls at the next
//! event start, manual rolls on request, continuous never rolls.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;
use std::time::{Duration, Instant};

use vigil_detection::frame::Frame;

use crate::filename::{expand, FormatContext};
use crate::sink::{FileKind, SharedSink};
use crate::writer::{MovieFactory, MovieHandle, MovieSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelapseMode {
    Daily,
    Hourly,
    Manual,
    Continuous,
    PerEvent,
}

impl TimelapseMode {
    pub fn from_config(s: &str) -> TimelapseMode {
        match s {
            "hourly" => TimelapseMode::Hourly,
            "manual" => TimelapseMode::Manual,
            "continuous" => TimelapseMode::Continuous,
            "event" => TimelapseMode::PerEvent,
            _ => TimelapseMode::Daily,
        }
    }
}

pub struct Timelapse {
    mode: TimelapseMode,
    interval: Duration,
    filename_fmt: String,
    target_dir: PathBuf,
    factory: MovieFactory,
    camera_id: u32,
    fps: u32,
    sink: SharedSink,
    last_shot: Option<Instant>,
    current: Option<MovieHandle>,
    current_stem: String,
    opened_at_us: i64,
    roll_requested: bool,
}

impl Timelapse {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: TimelapseMode,
        interval_secs: u64,
        filename_fmt: String,
        target_dir: PathBuf,
        factory: MovieFactory,
        camera_id: u32,
        fps: u32,
        sink: SharedSink,
    ) -> Timelapse {
        Timelapse {
            mode,
            interval: Duration::from_secs(interval_secs),
            filename_fmt,
            target_dir,
            factory,
            camera_id,
            fps,
            sink,
            last_shot: None,
            current: None,
            current_stem: String::new(),
            opened_at_us: 0,
            roll_requested: false,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Event-start notification for the per-event mode.
    pub fn on_event_start(&mut self) {
        if self.mode == TimelapseMode::PerEvent {
            self.roll_requested = true;
        }
    }

    /// Manual rollover request (control surface).
    pub fn request_rollover(&mut self) {
        self.roll_requested = true;
    }

    /// Called once per captured frame; appends the frame when the interval
    /// elapsed.
    pub fn tick(&mut self, frame: &Frame, now: Instant, ctx: &FormatContext) {
        if !self.enabled() {
            return;
        }
        if let Some(last) = self.last_shot {
            if now.duration_since(last) < self.interval {
                return;
            }
        }
        self.last_shot = Some(now);

        let stem = expand(&self.filename_fmt, ctx, frame.timestamp);
        let rolled_by_name = matches!(self.mode, TimelapseMode::Daily | TimelapseMode::Hourly)
            && self.current.is_some()
            && stem != self.current_stem;
        if rolled_by_name || self.roll_requested {
            self.close();
            self.roll_requested = false;
        }

        if self.current.is_none() {
            let path = self.target_dir.join(format!("{stem}.y4m"));
            let spec = MovieSpec {
                path: path.clone(),
                width: frame.width(),
                height: frame.height(),
                fps: self.fps,
                timebase: (1, 1_000_000),
            };
            match (self.factory)(&spec) {
                Ok(writer) => {
                    self.sink.file_created(
                        self.camera_id,
                        &path,
                        FileKind::MovieTimelapse,
                        frame.timestamp,
                    );
                    self.current = Some(MovieHandle::spawn(
                        writer,
                        path,
                        FileKind::MovieTimelapse,
                        self.camera_id,
                        self.sink.clone(),
                    ));
                    self.current_stem = stem;
                    self.opened_at_us = frame.timestamp.as_micros();
                }
                Err(e) => {
                    error!("could not open time-lapse {:?}: {e:#}", path);
                    self.sink.file_error(self.camera_id, &path, &format!("{e:#}"));
                    return;
                }
            }
        }

        if let Some(handle) = &self.current {
            let pts = frame.timestamp.as_micros() - self.opened_at_us;
            handle.write(frame.clone(), pts);
        }
    }

    /// Closes the current file, if any.
    pub fn close(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.close();
        }
        self.current_stem.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use crate::writer::y4m_factory;
    use std::fs;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "vigil-timelapse-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn interval_gates_appends() {
        let dir = temp_dir();
        let sink = SharedSink::new(Box::new(LogSink));
        let mut tl = Timelapse::new(
            TimelapseMode::Continuous,
            5,
            "lapse".to_string(),
            dir.clone(),
            y4m_factory(),
            1,
            10,
            sink,
        );
        let f = Frame::blank(16, 16).unwrap();
        let ctx = FormatContext::default();
        let t0 = Instant::now();

        tl.tick(&f, t0, &ctx); // opens + first frame
        tl.tick(&f, t0 + Duration::from_secs(1), &ctx); // gated
        tl.tick(&f, t0 + Duration::from_secs(6), &ctx); // second frame
        tl.close();

        let bytes = fs::read(dir.join("lapse.y4m")).unwrap();
        let header = b"YUV4MPEG2 W16 H16 F10:1 Ip A1:1 C420\n";
        let frame_size = 6 + 16 * 16 * 3 / 2;
        assert_eq!(bytes.len(), header.len() + 2 * frame_size);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn name_change_rolls_daily_file() {
        let dir = temp_dir();
        let sink = SharedSink::new(Box::new(LogSink));
        let mut tl = Timelapse::new(
            TimelapseMode::Daily,
            1,
            "%v-lapse".to_string(), // event number stands in for the date
            dir.clone(),
            y4m_factory(),
            1,
            10,
            sink,
        );
        let f = Frame::blank(16, 16).unwrap();
        let t0 = Instant::now();

        let mut ctx = FormatContext::default();
        ctx.event_nr = 1;
        tl.tick(&f, t0, &ctx);
        ctx.event_nr = 2;
        tl.tick(&f, t0 + Duration::from_secs(2), &ctx);
        tl.close();

        assert!(dir.join("01-lapse.y4m").exists());
        assert!(dir.join("02-lapse.y4m").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
