//! vigil camera hub.
//!
//! Watches one or more cameras for motion and writes event movies,
//! stills, snapshots and time-lapse files, announcing everything through
//! hook scripts and the event sink.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, sleep};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use docopt::Docopt;

mod camera_loop;
mod capture;
mod config;
mod filename;
mod picture;
mod preview;
mod scripts;
mod sink;
mod timelapse;
mod writer;

use crate::camera_loop::{CameraLoop, Watchdog};
use crate::capture::{Capture, SyntheticCapture};
use crate::config::{CameraConfig, HubConfig};
use crate::preview::PreviewSlot;
use crate::scripts::ScriptLauncher;
use crate::sink::{LogSink, SharedSink};

// A counter representing the amount of active camera threads.
static GLOBAL_THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);

const USAGE: &str = "
vigil camera hub: watches cameras for motion and records events.

Usage:
  vigil-camera-hub [--config=<file>]
  vigil-camera-hub (--version | -v)
  vigil-camera-hub (--help | -h)

Options:
    --config=<file>     Camera configuration file [default: cameras.yaml]
    --version, -v       Show version
    --help, -h          Show help
";

#[derive(Debug, Clone, Deserialize)]
struct Args {
    flag_config: String,
}

fn open_source(conf: &CameraConfig) -> Box<dyn Capture> {
    // Real drivers (V4L2, RTSP, MJPEG) register here; the synthetic
    // pattern is the built-in fallback and test source.
    match conf.source.as_str() {
        "synthetic" => Box::new(SyntheticCapture::new(conf.width, conf.height)),
        other => {
            warn!("unknown capture source {:?}, using the synthetic pattern", other);
            Box::new(SyntheticCapture::new(conf.width, conf.height))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_NAME").to_string() + ", version: " + env!("CARGO_PKG_VERSION");
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(Some(version)))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let hub = HubConfig::load(Path::new(&args.flag_config))?;
    if hub.cameras.is_empty() {
        println!("No cameras configured in {}.", args.flag_config);
        return Ok(());
    }

    let sink = SharedSink::new(Box::new(LogSink));
    let scripts = ScriptLauncher::start();

    // Every task holds a clone of the receiver; dropping the sender in the
    // signal handler closes the channel and every loop winds down at its
    // next safe point.
    let (shutdown_tx, shutdown_rx) = unbounded::<()>();
    let tx_slot = Mutex::new(Some(shutdown_tx));
    ctrlc::set_handler(move || {
        println!("Shutting down...");
        tx_slot.lock().unwrap().take();
    })?;

    let mut watchdogs = Vec::new();

    for conf in hub.cameras.into_iter() {
        println!("Starting camera: {:?}", conf.name);
        std::fs::create_dir_all(&conf.target_dir)?;

        let watchdog = Watchdog::new();
        watchdogs.push((conf.name.clone(), conf.watchdog_tmo, conf.watchdog_kill, watchdog.clone()));

        let sink = sink.clone();
        let scripts = scripts.clone();
        let shutdown = shutdown_rx.clone();

        GLOBAL_THREAD_COUNT.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            camera_thread(conf, sink, scripts, watchdog, shutdown);
            GLOBAL_THREAD_COUNT.fetch_sub(1, Ordering::SeqCst);
        });
    }

    supervise(watchdogs, shutdown_rx);

    // Terminate when no cameras are left running.
    while GLOBAL_THREAD_COUNT.load(Ordering::SeqCst) != 0 {
        sleep(Duration::from_millis(10));
    }
    Ok(())
}

/// Runs one camera until shutdown, restarting it after failures.
fn camera_thread(
    conf: CameraConfig,
    sink: SharedSink,
    scripts: ScriptLauncher,
    watchdog: Arc<Watchdog>,
    shutdown: Receiver<()>,
) {
    loop {
        watchdog.revive();
        let preview = PreviewSlot::new();
        let capture = open_source(&conf);
        let result = CameraLoop::new(
            conf.clone(),
            capture,
            sink.clone(),
            scripts.clone(),
            preview,
            watchdog.clone(),
            shutdown.clone(),
        )
        .and_then(|mut cam| cam.run());

        match result {
            Ok(()) => return, // clean shutdown
            Err(e) => {
                error!("[{}] camera loop failed: {e:#}", conf.name);
            }
        }
        if matches!(
            shutdown.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ) {
            return;
        }
        println!(
            "[{}] There was a problem with the camera. Will try again soon.",
            conf.name
        );
        sleep(Duration::from_secs(10));
    }
}

/// Watchdog supervisor: asks stuck cameras for a capture reset and, after
/// a further grace period, for a cooperative kill (the restart loop then
/// brings the camera back).
fn supervise(
    watchdogs: Vec<(String, u64, u64, Arc<Watchdog>)>,
    shutdown: Receiver<()>,
) {
    thread::spawn(move || loop {
        if matches!(
            shutdown.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ) {
            return;
        }
        for (name, tmo, kill, wd) in &watchdogs {
            let stale = wd.stale_for();
            if stale > Duration::from_secs(*tmo + *kill) {
                error!("[{name}] watchdog kill after {:?} without a frame", stale);
                wd.request_kill();
            } else if stale > Duration::from_secs(*tmo) {
                warn!("[{name}] watchdog timeout after {:?}, requesting reset", stale);
                wd.request_reset();
            }
        }
        sleep(Duration::from_secs(1));
    });
}
