//! The per-camera loop: capture pacing, detection, event dispatch, writer
//! fan-out, snapshots, time-lapse, preview and the watchdog contract.
//!
//! One OS thread runs this loop per camera. It owns the capture handle,
//! the detection model and the event machine outright; writers live on
//! their own threads behind bounded channels. A detection panic kills only
//! this camera and the supervisor restarts it.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, TryRecvError};

use vigil_detection::event::{EventAction, EventMachine, FramePhase, RingEntry};
use vigil_detection::frame::{Frame, FrameVerdict, Timestamp};
use vigil_detection::mask;
use vigil_detection::model::DetectionModel;
use vigil_detection::pixel::rotate::{self, Rotator};

use crate::capture::{Capture, CaptureError};
use crate::config::CameraConfig;
use crate::filename::{expand, FormatContext};
use crate::picture::{motion_image, write_snapshot, PictureType};
use crate::preview::PreviewSlot;
use crate::scripts::ScriptLauncher;
use crate::sink::{FileKind, SharedSink};
use crate::timelapse::{Timelapse, TimelapseMode};
use crate::writer::{
    extpipe_factory, y4m_factory, MovieFactory, MovieHandle, MovieSpec, StillJob, StillWriter,
};

/// Consecutive capture misses before the camera counts as lost.
pub const MAX_MISSED_FRAMES: u32 = 30;
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Shared per-camera liveness state. The camera thread beats it once per
/// frame; the supervisor requests resets and, as a last resort, a
/// cooperative kill at the next safe point.
pub struct Watchdog {
    epoch: Instant,
    last_beat_us: AtomicU64,
    reset_requested: AtomicBool,
    kill_requested: AtomicBool,
}

impl Watchdog {
    pub fn new() -> Arc<Watchdog> {
        Arc::new(Watchdog {
            epoch: Instant::now(),
            last_beat_us: AtomicU64::new(0),
            reset_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
        })
    }

    pub fn touch(&self) {
        self.last_beat_us
            .store(self.epoch.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    pub fn stale_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_micros() as u64;
        Duration::from_micros(now.saturating_sub(self.last_beat_us.load(Ordering::Relaxed)))
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Relaxed);
    }

    pub fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::Relaxed)
    }

    pub fn request_kill(&self) {
        self.kill_requested.store(true, Ordering::Relaxed);
    }

    pub fn killed(&self) -> bool {
        self.kill_requested.load(Ordering::Relaxed)
    }

    /// Clears pending flags when the supervisor restarts the camera.
    pub fn revive(&self) {
        self.reset_requested.store(false, Ordering::Relaxed);
        self.kill_requested.store(false, Ordering::Relaxed);
        self.touch();
    }
}

struct OpenMovie {
    handle: MovieHandle,
    /// Microsecond timestamp of the first written frame; PTS zero is the
    /// oldest pre-capture frame, so the ring flush keeps its spacing.
    start_us: Option<i64>,
}

pub struct CameraLoop {
    conf: CameraConfig,
    capture: Box<dyn Capture>,
    model: DetectionModel,
    machine: EventMachine,
    rotator: Rotator,
    sink: SharedSink,
    scripts: ScriptLauncher,
    preview: PreviewSlot,
    sub_preview: PreviewSlot,
    watchdog: Arc<Watchdog>,
    shutdown: Receiver<()>,
    movie_factory: MovieFactory,
    stills: StillWriter,
    timelapse: Timelapse,
    movie: Option<OpenMovie>,
    ptype: PictureType,
    host: String,
    event_text: String,
    current_event: u64,
    missed: u32,
}

impl CameraLoop {
    pub fn new(
        conf: CameraConfig,
        capture: Box<dyn Capture>,
        sink: SharedSink,
        scripts: ScriptLauncher,
        preview: PreviewSlot,
        watchdog: Arc<Watchdog>,
        shutdown: Receiver<()>,
    ) -> Result<CameraLoop> {
        let (cap_w, cap_h) = capture.dimensions();
        let rotator = Rotator::new(conf.rotate, conf.flip(), cap_w, cap_h);
        let (w, h) = rotator.output_dimensions();

        let mut model = DetectionModel::new(conf.detection_config());
        if !conf.mask_file.is_empty() {
            match mask::load_pgm(conf.mask_file.as_ref(), w, h) {
                Ok(m) => model.set_fixed_mask(Some(m)),
                Err(e) => error!(
                    "[{}] could not load mask {:?}, treating as all-pass: {e}",
                    conf.name, conf.mask_file
                ),
            }
        }
        if !conf.mask_privacy.is_empty() {
            match mask::load_pgm(conf.mask_privacy.as_ref(), w, h) {
                Ok(m) => model.set_privacy_mask(Some(m)),
                Err(e) => error!(
                    "[{}] could not load privacy mask {:?}, treating as all-pass: {e}",
                    conf.name, conf.mask_privacy
                ),
            }
        }

        let machine = EventMachine::new(conf.event_config(), w, h);
        let stills = StillWriter::spawn(conf.camera_id, sink.clone(), scripts.clone());
        let movie_factory = y4m_factory();
        let timelapse = Timelapse::new(
            TimelapseMode::from_config(&conf.timelapse_mode),
            conf.timelapse_interval,
            conf.timelapse_filename.clone(),
            PathBuf::from(&conf.target_dir),
            movie_factory.clone(),
            conf.camera_id,
            conf.framerate,
            sink.clone(),
        );

        Ok(CameraLoop {
            ptype: PictureType::from_config(&conf.picture_type),
            host: crate::filename::hostname(),
            model,
            machine,
            rotator,
            capture,
            sink,
            scripts,
            preview,
            sub_preview: PreviewSlot::new(),
            watchdog,
            shutdown,
            movie_factory,
            stills,
            timelapse,
            movie: None,
            event_text: String::new(),
            current_event: 0,
            missed: 0,
            conf,
        })
    }

    /// Swaps the movie backend; used by tests and by callers that bring a
    /// real muxer.
    pub fn set_movie_factory(&mut self, factory: MovieFactory) {
        self.movie_factory = factory;
    }

    /// Half-resolution preview for bandwidth-limited subscribers; only fed
    /// when the frame dimensions allow the 2x2 subsample.
    pub fn sub_preview(&self) -> PreviewSlot {
        self.sub_preview.clone()
    }

    fn shutdown_requested(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Runs until shutdown, watchdog kill or a fatal capture error.
    pub fn run(&mut self) -> Result<()> {
        self.capture
            .open()
            .map_err(|e| anyhow!("[{}] {e}", self.conf.name))?;
        info!("[{}] camera loop running", self.conf.name);

        let interval = self.conf.frame_interval();
        let mut next_tick = Instant::now();
        let mut snapshot_last: Option<Instant> = None;

        loop {
            if self.shutdown_requested() {
                break;
            }
            if self.watchdog.killed() {
                self.finish();
                return Err(anyhow!("[{}] killed by the watchdog", self.conf.name));
            }
            if self.watchdog.take_reset() {
                warn!("[{}] watchdog requested a capture reset", self.conf.name);
                self.capture.close();
                self.reconnect()?;
            }

            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            }
            next_tick += interval;
            if next_tick + interval < Instant::now() {
                // Fell badly behind (blocked writer, suspended host);
                // re-anchor instead of bursting.
                next_tick = Instant::now();
            }

            let frame = match self.capture.next() {
                Ok(f) => {
                    self.missed = 0;
                    f
                }
                Err(CaptureError::Transient(msg)) => {
                    self.missed += 1;
                    debug!(
                        "[{}] transient capture error ({}): {msg}",
                        self.conf.name, self.missed
                    );
                    if self.missed >= MAX_MISSED_FRAMES {
                        self.camera_lost();
                        self.reconnect()?;
                    }
                    continue;
                }
                Err(e @ CaptureError::Fatal(_)) => {
                    self.finish();
                    return Err(anyhow!("[{}] {e}", self.conf.name));
                }
            };

            self.process_frame(frame, Instant::now(), &mut snapshot_last);
            self.watchdog.touch();
        }

        self.finish();
        Ok(())
    }

    /// One full capture->detect->dispatch step; separated from `run` so
    /// tests can drive frames without the pacing clock.
    fn process_frame(&mut self, mut frame: Frame, now: Instant, snapshot_last: &mut Option<Instant>) {
        self.rotator.apply(&mut frame);
        let (verdict, diff) = self.model.process(&frame);

        self.snapshot_tick(&frame, now, snapshot_last);
        if self.timelapse.enabled() {
            // The context must not borrow self while the timelapse is
            // borrowed mutably; snapshot the borrowed strings.
            let name = self.conf.name.clone();
            let text = self.event_text.clone();
            let host = self.host.clone();
            let mut ctx = FormatContext {
                camera_name: &name,
                text_event: &text,
                host: &host,
                ..FormatContext::default()
            };
            ctx.camera_id = self.conf.camera_id;
            ctx.event_nr = self.current_event;
            ctx.noise = verdict.noise;
            ctx.threshold = verdict.threshold;
            ctx.width = frame.width();
            ctx.height = frame.height();
            ctx.fps = self.conf.framerate;
            self.timelapse.tick(&frame, now, &ctx);
        }

        let preview_frame = frame.clone();
        let actions = self.machine.offer(frame, diff, verdict, now);
        for action in actions {
            self.dispatch(action);
        }

        self.preview.offer(&preview_frame);
        if let Some(half) = rotate::scale_half(&preview_frame) {
            self.sub_preview.offer(&half);
        }
    }

    fn snapshot_tick(&mut self, frame: &Frame, now: Instant, last: &mut Option<Instant>) {
        if self.conf.snapshot_interval == 0 {
            return;
        }
        let due = match *last {
            None => true,
            Some(t) => now.duration_since(t) >= Duration::from_secs(self.conf.snapshot_interval),
        };
        if !due {
            return;
        }
        *last = Some(now);

        let stem = {
            let ctx = self.ctx(None, 0, None, Some(FileKind::ImageSnapshot));
            expand(&self.conf.snapshot_filename, &ctx, frame.timestamp)
        };
        match write_snapshot(
            self.conf.target_dir.as_ref(),
            &stem,
            frame,
            self.ptype,
            self.conf.picture_quality,
        ) {
            Ok(path) => {
                self.sink.file_created(
                    self.conf.camera_id,
                    &path,
                    FileKind::ImageSnapshot,
                    frame.timestamp,
                );
            }
            Err(e) => {
                error!("[{}] snapshot failed: {e:#}", self.conf.name);
            }
        }
    }

    fn dispatch(&mut self, action: EventAction) {
        match action {
            EventAction::EventStart { event_id, time } => {
                self.current_event = event_id;
                self.event_text = {
                    let ctx = self.ctx(None, event_id, None, None);
                    expand(&self.conf.text_event, &ctx, time)
                };
                self.sink
                    .event_start(self.conf.camera_id, event_id, time);
                self.run_hook(&self.conf.on_event_start, event_id, None, time);
                self.timelapse.on_event_start();
            }
            EventAction::OpenMovie { event_id, time } => {
                if self.conf.movie_output {
                    self.open_movie(event_id, time);
                }
            }
            EventAction::MotionDetected => {
                self.run_hook(
                    &self.conf.on_motion_detected,
                    self.current_event,
                    None,
                    Timestamp::now(),
                );
            }
            EventAction::AreaDetected { cell } => {
                debug!("[{}] area {} detected", self.conf.name, cell);
                self.run_hook(
                    &self.conf.on_area_detected,
                    self.current_event,
                    None,
                    Timestamp::now(),
                );
            }
            EventAction::WriteFrame { entry, phase, shot } => {
                self.write_frame(*entry, phase, shot);
            }
            EventAction::CloseMovie { .. } => {
                self.close_movie();
            }
            EventAction::EventEnd { event_id, time, .. } => {
                self.sink.event_end(self.conf.camera_id, event_id, time);
                self.run_hook(&self.conf.on_event_end, event_id, None, time);
                self.event_text.clear();
                self.current_event = 0;
            }
        }
    }

    fn write_frame(&mut self, entry: RingEntry, _phase: FramePhase, shot: u64) {
        let RingEntry {
            frame,
            diff,
            verdict,
        } = entry;
        let time = frame.timestamp;

        if self.conf.picture_output {
            let (path, script) = {
                let mut ctx = self.ctx(Some(&verdict), self.current_event, None, Some(FileKind::Image));
                ctx.shot = shot;
                let stem = expand(&self.conf.picture_filename, &ctx, time);
                let path = PathBuf::from(&self.conf.target_dir)
                    .join(format!("{stem}.{}", self.ptype.extension()));
                let script = if self.conf.on_picture_save.is_empty() {
                    None
                } else {
                    let pstr = path.display().to_string();
                    ctx.filename = Some(&pstr);
                    Some(expand(&self.conf.on_picture_save, &ctx, time))
                };
                (path, script)
            };
            self.stills.write(StillJob {
                frame: frame.clone(),
                path,
                ptype: self.ptype,
                quality: self.conf.picture_quality,
                kind: FileKind::Image,
                script,
            });
        }

        if self.conf.picture_output_motion {
            let smart = (self.conf.smart_mask_speed > 0).then(|| self.model.smartmask_final());
            let labels = diff
                .labels
                .as_ref()
                .map(|l| (l.labels.as_slice(), l.largest_label));
            let image = motion_image(
                &diff.out,
                frame.width(),
                frame.height(),
                smart,
                self.model.fixed_mask(),
                labels,
            );
            let path = {
                let mut ctx = self.ctx(
                    Some(&verdict),
                    self.current_event,
                    None,
                    Some(FileKind::ImageMotion),
                );
                ctx.shot = shot;
                let stem = expand(&self.conf.picture_filename, &ctx, time);
                PathBuf::from(&self.conf.target_dir)
                    .join(format!("{stem}m.{}", self.ptype.extension()))
            };
            self.stills.write(StillJob {
                frame: image,
                path,
                ptype: self.ptype,
                quality: self.conf.picture_quality,
                kind: FileKind::ImageMotion,
                script: None,
            });
        }

        if let Some(movie) = &mut self.movie {
            let start = *movie.start_us.get_or_insert_with(|| time.as_micros());
            movie.handle.write(frame, (time.as_micros() - start).max(0));
        }
    }

    fn open_movie(&mut self, event_id: u64, time: Timestamp) {
        let path = {
            let ctx = self.ctx(None, event_id, None, Some(FileKind::Movie));
            let stem = expand(&self.conf.movie_filename, &ctx, time);
            PathBuf::from(&self.conf.target_dir).join(format!("{stem}.y4m"))
        };
        let spec = MovieSpec {
            path: path.clone(),
            width: self.model_width(),
            height: self.model_height(),
            fps: self.conf.framerate,
            timebase: (1, 1_000_000),
        };

        let factory = if self.conf.movie_extpipe.is_empty() {
            self.movie_factory.clone()
        } else {
            let pstr = path.display().to_string();
            let mut ctx = self.ctx(None, event_id, None, Some(FileKind::Movie));
            ctx.filename = Some(&pstr);
            let cmd = expand(&self.conf.movie_extpipe, &ctx, time);
            extpipe_factory(cmd)
        };

        match factory(&spec) {
            Ok(writer) => {
                self.sink
                    .file_created(self.conf.camera_id, &path, FileKind::Movie, time);
                let pstr = path.display().to_string();
                self.run_hook(
                    &self.conf.on_movie_start,
                    event_id,
                    Some(&pstr),
                    time,
                );
                self.movie = Some(OpenMovie {
                    handle: MovieHandle::spawn(
                        writer,
                        path,
                        FileKind::Movie,
                        self.conf.camera_id,
                        self.sink.clone(),
                    ),
                    start_us: None,
                });
            }
            Err(e) => {
                error!("[{}] could not open movie {:?}: {e:#}", self.conf.name, path);
                self.sink
                    .file_error(self.conf.camera_id, &path, &format!("{e:#}"));
            }
        }
    }

    fn close_movie(&mut self) {
        if let Some(movie) = self.movie.take() {
            let path = movie.handle.path.display().to_string();
            movie.handle.close();
            self.run_hook(
                &self.conf.on_movie_end,
                self.current_event,
                Some(&path),
                Timestamp::now(),
            );
        }
    }

    fn camera_lost(&mut self) {
        warn!(
            "[{}] camera lost after {} missed frames",
            self.conf.name, self.missed
        );
        self.run_hook(&self.conf.on_camera_lost, 0, None, Timestamp::now());
    }

    /// Reopens the capture source with capped exponential backoff.
    fn reconnect(&mut self) -> Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if self.shutdown_requested() {
                return Ok(());
            }
            if self.watchdog.killed() {
                self.finish();
                return Err(anyhow!("[{}] killed by the watchdog", self.conf.name));
            }
            self.capture.close();
            thread::sleep(backoff);
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
            match self.capture.open() {
                Ok(()) => {
                    info!("[{}] camera found again", self.conf.name);
                    self.missed = 0;
                    self.run_hook(&self.conf.on_camera_found, 0, None, Timestamp::now());
                    return Ok(());
                }
                Err(CaptureError::Transient(msg)) => {
                    debug!("[{}] reconnect failed: {msg}", self.conf.name);
                }
                Err(e @ CaptureError::Fatal(_)) => {
                    self.finish();
                    return Err(anyhow!("[{}] {e}", self.conf.name));
                }
            }
        }
    }

    /// Ends an open event cleanly and releases the writers.
    fn finish(&mut self) {
        let actions = self.machine.force_end(Timestamp::now());
        for action in actions {
            self.dispatch(action);
        }
        self.timelapse.close();
        self.capture.close();
    }

    fn run_hook(&self, cmdline: &str, event_id: u64, filename: Option<&str>, time: Timestamp) {
        if cmdline.is_empty() {
            return;
        }
        let ctx = self.ctx(None, event_id, filename, None);
        self.scripts.run(&expand(cmdline, &ctx, time));
    }

    fn model_width(&self) -> usize {
        self.conf.detect_width()
    }

    fn model_height(&self) -> usize {
        self.conf.detect_height()
    }

    fn ctx<'a>(
        &'a self,
        verdict: Option<&FrameVerdict>,
        event_id: u64,
        filename: Option<&'a str>,
        kind: Option<FileKind>,
    ) -> FormatContext<'a> {
        FormatContext {
            camera_name: &self.conf.name,
            camera_id: self.conf.camera_id,
            event_nr: event_id,
            shot: 0,
            diffs: verdict.map_or(0, |v| v.changed_pixels),
            noise: verdict.map_or(self.model.noise(), |v| v.noise),
            threshold: verdict.map_or(self.model.threshold(), |v| v.threshold),
            location: verdict.and_then(|v| v.location),
            total_labels: verdict.map_or(0, |v| v.total_labels),
            width: self.model_width(),
            height: self.model_height(),
            fps: self.conf.framerate,
            text_event: &self.event_text,
            host: &self.host,
            filename,
            file_kind: kind.map(FileKind::id),
        }
    }
}
