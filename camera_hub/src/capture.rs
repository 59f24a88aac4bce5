//! The capture-driver seam.
//!
//! Real drivers (V4L2, RTSP, MJPEG) live outside this crate; they plug in
//! by implementing [`Capture`]. Errors split into transient (retried with
//! backoff until the camera-lost threshold trips) and fatal (the camera
//! task ends and the supervisor restarts it). The built-in synthetic
//! source generates a test pattern with a moving block and doubles as the
//! test harness for the camera loop.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use vigil_detection::frame::{Frame, Timestamp};

#[derive(Debug)]
pub enum CaptureError {
    /// Lost frame or short read; retry in place.
    Transient(String),
    /// The device is gone; the camera task must be restarted.
    Fatal(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Transient(m) => write!(f, "transient capture error: {m}"),
            CaptureError::Fatal(m) => write!(f, "fatal capture error: {m}"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// One camera's frame source. All calls happen on the camera thread.
pub trait Capture: Send {
    fn open(&mut self) -> Result<(), CaptureError>;
    /// Blocks until the next frame is available and returns it as YUV420p.
    fn next(&mut self) -> Result<Frame, CaptureError>;
    fn close(&mut self);
    fn dimensions(&self) -> (usize, usize);
}

/// Deterministic test pattern: a flat grey scene with a bright block that
/// crosses the frame once per `period` frames, resting in between.
pub struct SyntheticCapture {
    width: usize,
    height: usize,
    index: u64,
    /// Frames per sweep cycle; the block moves during the first half.
    pub period: u64,
    opened: bool,
}

impl SyntheticCapture {
    pub fn new(width: usize, height: usize) -> Self {
        SyntheticCapture {
            width,
            height,
            index: 0,
            period: 100,
            opened: false,
        }
    }
}

impl Capture for SyntheticCapture {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.opened = true;
        Ok(())
    }

    fn next(&mut self) -> Result<Frame, CaptureError> {
        if !self.opened {
            return Err(CaptureError::Fatal("synthetic source not opened".into()));
        }
        let (w, h) = (self.width, self.height);
        let mut data = vec![128u8; w * h * 3 / 2];

        let phase = self.index % self.period;
        if phase < self.period / 2 {
            // Sweep a 32x32 block left to right across the middle.
            let span = w.saturating_sub(32).max(1);
            let x0 = (phase as usize * span) / (self.period as usize / 2).max(1);
            let y0 = h / 2 - 16;
            for y in y0..y0 + 32 {
                for x in x0..(x0 + 32).min(w) {
                    data[y * w + x] = 224;
                }
            }
        }

        let frame = Frame::from_yuv420(w, h, data, self.index, Timestamp::now())
            .map_err(|e| CaptureError::Fatal(e.to_string()))?;
        self.index += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_requires_open() {
        let mut c = SyntheticCapture::new(64, 64);
        assert!(matches!(c.next(), Err(CaptureError::Fatal(_))));
        c.open().unwrap();
        let f = c.next().unwrap();
        assert_eq!(f.width(), 64);
        assert_eq!(f.index, 0);
        assert_eq!(c.next().unwrap().index, 1);
    }
}
