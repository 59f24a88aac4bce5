//! Movie and still writers.
//!
//! Each writer runs on its own thread behind a bounded channel so slow
//! disks exert backpressure instead of growing queues. The camera loop
//! uses a blocking send for event movies (correctness over latency) and
//! the writers report their outcomes through the shared sink. The
//! built-in movie sink is a raw YUV4MPEG2 spool; container/codec muxers
//! are collaborators that implement [`MovieWriter`], and `movie_extpipe`
//! streams raw frames to an external encoder process instead.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Sender};
use vigil_detection::frame::{Frame, Timestamp};

use crate::picture::{write_picture, PictureType};
use crate::scripts::ScriptLauncher;
use crate::sink::{FileKind, SharedSink};

/// Depth of every writer inbox; a full channel blocks (movie/stills) or
/// drops (preview) at the producer.
pub const WRITER_QUEUE_DEPTH: usize = 4;

const EXTPIPE_WAIT: Duration = Duration::from_secs(3);

/// Parameters a movie writer is opened with. `timebase` is the rational
/// unit `pts` is expressed in.
#[derive(Debug, Clone)]
pub struct MovieSpec {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub timebase: (u32, u32),
}

/// Container/codec seam. Writers own PTS monotonicity for their codec.
pub trait MovieWriter: Send {
    fn write(&mut self, frame: &Frame, pts: i64) -> Result<()>;
    /// Compressed packets from a passthrough-capable capture driver.
    fn write_passthrough(&mut self, packet: &[u8]) -> Result<()>;
    fn close(self: Box<Self>) -> Result<PathBuf>;
}

/// Creates a writer for one movie file.
pub type MovieFactory =
    std::sync::Arc<dyn Fn(&MovieSpec) -> Result<Box<dyn MovieWriter>> + Send + Sync>;

/// The default factory: raw YUV4MPEG2 spool files.
pub fn y4m_factory() -> MovieFactory {
    std::sync::Arc::new(|spec| Ok(Box::new(Y4mWriter::create(spec)?) as Box<dyn MovieWriter>))
}

/// Factory that pipes raw frames into an external encoder command.
pub fn extpipe_factory(cmdline: String) -> MovieFactory {
    std::sync::Arc::new(move |spec| {
        Ok(Box::new(ExtPipeWriter::spawn(&cmdline, spec)?) as Box<dyn MovieWriter>)
    })
}

/// Uncompressed YUV4MPEG2 spool; trivially correct and replaceable by any
/// real muxer at the `MovieWriter` seam.
pub struct Y4mWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl Y4mWriter {
    pub fn create(spec: &MovieSpec) -> Result<Y4mWriter> {
        if let Some(parent) = spec.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let file = File::create(&spec.path)
            .with_context(|| format!("could not create {}", spec.path.display()))?;
        let mut out = BufWriter::new(file);
        write!(
            out,
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C420\n",
            spec.width, spec.height, spec.fps
        )?;
        Ok(Y4mWriter {
            out,
            path: spec.path.clone(),
        })
    }
}

impl MovieWriter for Y4mWriter {
    fn write(&mut self, frame: &Frame, _pts: i64) -> Result<()> {
        self.out.write_all(b"FRAME\n")?;
        self.out.write_all(frame.planes())?;
        Ok(())
    }

    fn write_passthrough(&mut self, _packet: &[u8]) -> Result<()> {
        bail!("the YUV4MPEG2 spool cannot take passthrough packets");
    }

    fn close(mut self: Box<Self>) -> Result<PathBuf> {
        self.out.flush()?;
        Ok(self.path)
    }
}

/// Forks the user's encoder command and feeds it raw planar frames on
/// stdin. Shutdown is EOF, a bounded wait, then SIGKILL.
pub struct ExtPipeWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    path: PathBuf,
}

impl ExtPipeWriter {
    pub fn spawn(cmdline: &str, spec: &MovieSpec) -> Result<ExtPipeWriter> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmdline)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("could not exec extpipe {:?}", cmdline))?;
        let stdin = child.stdin.take();
        info!("extpipe started: {}", cmdline);
        Ok(ExtPipeWriter {
            child,
            stdin,
            path: spec.path.clone(),
        })
    }
}

impl MovieWriter for ExtPipeWriter {
    fn write(&mut self, frame: &Frame, _pts: i64) -> Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => {
                stdin.write_all(frame.planes()).context("extpipe write failed")?;
                Ok(())
            }
            None => bail!("extpipe stdin already closed"),
        }
    }

    fn write_passthrough(&mut self, packet: &[u8]) -> Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => {
                stdin.write_all(packet).context("extpipe write failed")?;
                Ok(())
            }
            None => bail!("extpipe stdin already closed"),
        }
    }

    fn close(mut self: Box<Self>) -> Result<PathBuf> {
        // EOF lets the encoder finish its trailer.
        drop(self.stdin.take());
        let deadline = std::time::Instant::now() + EXTPIPE_WAIT;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(50));
                }
                Ok(None) => {
                    warn!("extpipe did not exit, killing it");
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
                Err(e) => {
                    warn!("extpipe wait failed: {e}");
                    break;
                }
            }
        }
        Ok(self.path)
    }
}

enum MovieMsg {
    Frame(Box<Frame>, i64),
    Close,
}

/// A movie writer running on its own thread. Frames arrive over a bounded
/// channel in capture order; `close` joins the thread so the caller can
/// sequence the file-closed callback before the event-end callback.
pub struct MovieHandle {
    tx: Option<Sender<MovieMsg>>,
    join: Option<thread::JoinHandle<()>>,
    pub path: PathBuf,
    pub kind: FileKind,
}

impl MovieHandle {
    pub fn spawn(
        writer: Box<dyn MovieWriter>,
        path: PathBuf,
        kind: FileKind,
        camera_id: u32,
        sink: SharedSink,
    ) -> MovieHandle {
        let (tx, rx) = bounded::<MovieMsg>(WRITER_QUEUE_DEPTH);
        let thread_path = path.clone();
        let join = thread::spawn(move || {
            let mut writer = Some(writer);
            let mut failed = false;
            while let Ok(msg) = rx.recv() {
                match msg {
                    MovieMsg::Frame(frame, pts) => {
                        if failed {
                            continue;
                        }
                        if let Some(w) = writer.as_mut() {
                            if let Err(e) = w.write(&frame, pts) {
                                error!("movie write failed on {:?}: {e:#}", thread_path);
                                sink.file_error(camera_id, &thread_path, &format!("{e:#}"));
                                failed = true;
                            }
                        }
                    }
                    MovieMsg::Close => break,
                }
            }
            if let Some(w) = writer.take() {
                match w.close() {
                    Ok(p) => {
                        sink.file_closed(camera_id, &p, kind, Timestamp::now());
                    }
                    Err(e) => {
                        error!("movie close failed on {:?}: {e:#}", thread_path);
                        sink.file_error(camera_id, &thread_path, &format!("{e:#}"));
                    }
                }
            }
        });
        MovieHandle {
            tx: Some(tx),
            join: Some(join),
            path,
            kind,
        }
    }

    /// Blocking enqueue; frame order equals capture order.
    pub fn write(&self, frame: Frame, pts: i64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(MovieMsg::Frame(Box::new(frame), pts));
        }
    }

    /// Finishes the file; returns once the writer thread is gone and the
    /// file-closed callback has fired.
    pub fn close(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(MovieMsg::Close);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for MovieHandle {
    fn drop(&mut self) {
        // Best-effort flush when the camera task dies mid-event.
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(MovieMsg::Close);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// One still-image write, fully resolved by the camera loop.
pub struct StillJob {
    pub frame: Frame,
    pub path: PathBuf,
    pub ptype: PictureType,
    pub quality: u8,
    pub kind: FileKind,
    /// Pre-expanded on_picture_save command line, if configured.
    pub script: Option<String>,
}

/// Per-camera still writer thread.
#[derive(Clone)]
pub struct StillWriter {
    tx: Sender<StillJob>,
}

impl StillWriter {
    pub fn spawn(camera_id: u32, sink: SharedSink, scripts: ScriptLauncher) -> StillWriter {
        let (tx, rx) = bounded::<StillJob>(WRITER_QUEUE_DEPTH);
        thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                match write_picture(&job.path, &job.frame, job.ptype, job.quality) {
                    Ok(()) => {
                        sink.file_created(camera_id, &job.path, job.kind, job.frame.timestamp);
                        if let Some(cmd) = job.script {
                            scripts.run(&cmd);
                        }
                    }
                    Err(e) => {
                        error!("picture write failed on {:?}: {e:#}", job.path);
                        sink.file_error(camera_id, &job.path, &format!("{e:#}"));
                    }
                }
            }
        });
        StillWriter { tx }
    }

    /// Blocking enqueue.
    pub fn write(&self, job: StillJob) {
        let _ = self.tx.send(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "vigil-writer-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    #[test]
    fn y4m_spool_layout() {
        let path = temp_path("spool").with_extension("y4m");
        let spec = MovieSpec {
            path: path.clone(),
            width: 32,
            height: 16,
            fps: 10,
            timebase: (1, 1_000_000),
        };
        let mut w = Box::new(Y4mWriter::create(&spec).unwrap()) as Box<dyn MovieWriter>;
        let f = Frame::blank(32, 16).unwrap();
        w.write(&f, 0).unwrap();
        w.write(&f, 100_000).unwrap();
        let out = w.close().unwrap();

        let bytes = fs::read(&out).unwrap();
        let header = b"YUV4MPEG2 W32 H16 F10:1 Ip A1:1 C420\n";
        assert!(bytes.starts_with(header));
        let frame_size = 6 + 32 * 16 * 3 / 2;
        assert_eq!(bytes.len(), header.len() + 2 * frame_size);
        let _ = fs::remove_file(out);
    }

    #[test]
    fn movie_handle_reports_close_to_sink() {
        let (tx, rx) = mpsc::channel();
        let sink = SharedSink::new(Box::new(crate::sink::testing::RecordingSink(tx)));
        let path = temp_path("handle").with_extension("y4m");
        let spec = MovieSpec {
            path: path.clone(),
            width: 16,
            height: 16,
            fps: 5,
            timebase: (1, 1_000_000),
        };
        let writer = Box::new(Y4mWriter::create(&spec).unwrap());
        let handle = MovieHandle::spawn(writer, path.clone(), FileKind::Movie, 1, sink);
        handle.write(Frame::blank(16, 16).unwrap(), 0);
        handle.close();

        use crate::sink::testing::SinkCall;
        let calls: Vec<SinkCall> = rx.try_iter().collect();
        assert_eq!(calls, vec![SinkCall::FileClosed(path.clone(), 8)]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn extpipe_receives_frames_and_exits() {
        let out = temp_path("extpipe");
        let spec = MovieSpec {
            path: out.clone(),
            width: 16,
            height: 16,
            fps: 5,
            timebase: (1, 1_000_000),
        };
        let mut w = Box::new(
            ExtPipeWriter::spawn(&format!("cat > {}", out.display()), &spec).unwrap(),
        ) as Box<dyn MovieWriter>;
        let f = Frame::blank(16, 16).unwrap();
        w.write(&f, 0).unwrap();
        w.close().unwrap();

        let written = fs::read(&out).unwrap();
        assert_eq!(written.len(), 16 * 16 * 3 / 2);
        let _ = fs::remove_file(out);
    }
}
