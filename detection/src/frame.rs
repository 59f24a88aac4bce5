//! Frame and geometry types shared across the detection pipeline.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::DetectionError;

/// Wall-clock capture time, seconds plus microseconds.
///
/// Deadlines (event gap, watchdog) are tracked with a monotonic clock by the
/// camera loop; this type only travels with frames for PTS and filename
/// expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: d.as_secs() as i64,
            usec: d.subsec_micros(),
        }
    }

    /// Microseconds since the Unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.sec * 1_000_000 + i64::from(self.usec)
    }
}

/// One captured image in planar YUV420p layout, immutable once produced.
///
/// The buffer holds the full `w*h` luma plane followed by the two quarter
/// size chroma planes, exactly as the capture drivers deliver it. A frame
/// owns its pixel memory; ownership moves capture -> detection -> ring or
/// capture -> writer, which keeps the hot path free of copies.
#[derive(Debug, Clone)]
pub struct Frame {
    width: usize,
    height: usize,
    data: Vec<u8>,
    /// Monotonic per-camera frame index.
    pub index: u64,
    pub timestamp: Timestamp,
    /// Optional higher-resolution companion used for passthrough recording.
    pub high: Option<Box<Frame>>,
}

impl Frame {
    /// Wraps an owned YUV420p buffer. Both dimensions must be multiples of 8
    /// and the buffer must be exactly `w*h*3/2` bytes.
    pub fn from_yuv420(
        width: usize,
        height: usize,
        data: Vec<u8>,
        index: u64,
        timestamp: Timestamp,
    ) -> Result<Self, DetectionError> {
        if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
            return Err(DetectionError::BadDimensions(width, height));
        }
        let expected = width * height * 3 / 2;
        if data.len() != expected {
            return Err(DetectionError::BadPlaneSize {
                got: data.len(),
                expected,
            });
        }
        Ok(Frame {
            width,
            height,
            data,
            index,
            timestamp,
            high: None,
        })
    }

    /// A black frame (Y=0, chroma neutral).
    pub fn blank(width: usize, height: usize) -> Result<Self, DetectionError> {
        let mut data = vec![0u8; width * height * 3 / 2];
        for b in data[width * height..].iter_mut() {
            *b = 128;
        }
        Self::from_yuv420(width, height, data, 0, Timestamp { sec: 0, usec: 0 })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of luma pixels (`w*h`).
    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.pixels()]
    }

    pub fn u(&self) -> &[u8] {
        let n = self.pixels();
        &self.data[n..n + n / 4]
    }

    pub fn v(&self) -> &[u8] {
        let n = self.pixels();
        &self.data[n + n / 4..n + n / 2]
    }

    /// The whole planar buffer, Y then U then V.
    pub fn planes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access for in-place transforms (rotation, overlays).
    pub fn planes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Splits the buffer into mutable (Y, U, V) plane views.
    pub fn planes_mut_split(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let n = self.width * self.height;
        let (y, uv) = self.data.split_at_mut(n);
        let (u, v) = uv.split_at_mut(n / 4);
        (y, u, v)
    }

    /// Replaces the pixel buffer after a geometry-changing transform.
    pub(crate) fn replace_geometry(&mut self, width: usize, height: usize, data: Vec<u8>) {
        debug_assert_eq!(data.len(), width * height * 3 / 2);
        self.width = width;
        self.height = height;
        self.data = data;
    }
}

/// Axis-aligned box around detected motion. `x`/`y` are the box center, the
/// coordinates reported by the `%K`/`%L` filename specifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Location {
    pub fn from_bounds(minx: usize, maxx: usize, miny: usize, maxy: usize) -> Self {
        let width = maxx - minx + 1;
        let height = maxy - miny + 1;
        Location {
            x: minx + width / 2,
            y: miny + height / 2,
            width,
            height,
        }
    }

    fn min_x(&self) -> usize {
        self.x - self.width / 2
    }

    fn min_y(&self) -> usize {
        self.y - self.height / 2
    }

    /// Smallest box covering both operands; used for the per-event running
    /// union.
    pub fn union(&self, other: &Location) -> Location {
        let minx = self.min_x().min(other.min_x());
        let miny = self.min_y().min(other.min_y());
        let maxx = (self.min_x() + self.width - 1).max(other.min_x() + other.width - 1);
        let maxy = (self.min_y() + self.height - 1).max(other.min_y() + other.height - 1);
        Location::from_bounds(minx, maxx, miny, maxy)
    }
}

/// Outcome of the pixel stage for one frame: the thresholded, masked and
/// despeckled binary difference image plus its labelling summary.
#[derive(Debug, Clone)]
pub struct DiffResult {
    /// Binary difference image, 0 or 255 per luma pixel.
    pub out: Vec<u8>,
    /// Number of set pixels in `out`.
    pub diffs: usize,
    /// Present when the despeckle recipe contained `l`.
    pub labels: Option<LabelInfo>,
}

/// Connected-component summary produced by the `l` despeckle step.
#[derive(Debug, Clone)]
pub struct LabelInfo {
    /// Per-pixel component id, 0 for background.
    pub labels: Vec<u32>,
    /// Components that survived the minimum-size filter.
    pub total_labels: usize,
    pub largest_label: u32,
    pub largest_label_pixels: usize,
    /// Bounding box of the dominant component.
    pub location: Location,
}

/// What the detection model concluded about one frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameVerdict {
    pub changed_pixels: usize,
    pub noise: u8,
    pub threshold: usize,
    pub lightswitch: bool,
    /// `changed_pixels > threshold` and not a lightswitch frame.
    pub motion_detected: bool,
    pub location: Option<Location>,
    pub total_labels: usize,
}

impl FrameVerdict {
    pub fn quiet(noise: u8, threshold: usize) -> Self {
        FrameVerdict {
            changed_pixels: 0,
            noise,
            threshold,
            lightswitch: false,
            motion_detected: false,
            location: None,
            total_labels: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_bad_dimensions() {
        assert!(Frame::from_yuv420(100, 96, vec![0; 100 * 96 * 3 / 2], 0, Timestamp::now()).is_err());
        assert!(Frame::blank(96, 96).is_ok());
    }

    #[test]
    fn frame_rejects_short_buffer() {
        let err = Frame::from_yuv420(96, 96, vec![0; 10], 0, Timestamp::now());
        assert!(matches!(err, Err(DetectionError::BadPlaneSize { .. })));
    }

    #[test]
    fn plane_views_partition_the_buffer() {
        let f = Frame::blank(64, 32).unwrap();
        assert_eq!(f.y().len(), 64 * 32);
        assert_eq!(f.u().len(), 64 * 32 / 4);
        assert_eq!(f.v().len(), 64 * 32 / 4);
        assert_eq!(f.u()[0], 128);
    }

    #[test]
    fn location_union_covers_both() {
        let a = Location::from_bounds(10, 19, 10, 19);
        let b = Location::from_bounds(30, 39, 0, 9);
        let u = a.union(&b);
        assert_eq!(u.width, 30);
        assert_eq!(u.height, 20);
        assert_eq!(u.x, 10 + 15);
        assert_eq!(u.y, 0 + 10);
    }
}
