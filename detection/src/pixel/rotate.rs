//! Image rotation and flipping for cameras mounted sideways or upside
//! down, plus the half-resolution subsample for the sub-stream.
//!
//! Only multiples of 90 degrees are supported; 180 degrees runs in place
//! via quad-byte reversal while 90/270 go through a scratch buffer. The
//! three planes are transformed independently, chroma at halved
//! dimensions.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use log::warn;

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlipAxis {
    #[default]
    None,
    /// Mirror over the horizontal axis (top and bottom rows trade places).
    Horizontal,
    /// Mirror over the vertical axis (each row is reversed).
    Vertical,
}

/// Per-camera rotation state, built once at camera start.
pub struct Rotator {
    degrees: u32,
    axis: FlipAxis,
    capture_width: usize,
    capture_height: usize,
}

impl Rotator {
    /// `rotate` is the configured angle in degrees; anything that is not a
    /// multiple of 90 disables rotation with a warning.
    pub fn new(rotate: i32, axis: FlipAxis, width: usize, height: usize) -> Rotator {
        let mut degrees = rotate.rem_euclid(360) as u32;
        if degrees % 90 != 0 {
            warn!(
                "config option rotate must be a multiple of 90 (got {}), disabling rotation",
                rotate
            );
            degrees = 0;
        }
        Rotator {
            degrees,
            axis,
            capture_width: width,
            capture_height: height,
        }
    }

    /// Dimensions of frames after `apply`; swapped for 90/270.
    pub fn output_dimensions(&self) -> (usize, usize) {
        if self.degrees == 90 || self.degrees == 270 {
            (self.capture_height, self.capture_width)
        } else {
            (self.capture_width, self.capture_height)
        }
    }

    pub fn is_noop(&self) -> bool {
        self.degrees == 0 && self.axis == FlipAxis::None
    }

    /// Flips (first) and rotates the frame in place. The frame must carry
    /// capture dimensions.
    pub fn apply(&self, frame: &mut Frame) {
        if self.is_noop() {
            return;
        }
        debug_assert_eq!(frame.width(), self.capture_width);
        debug_assert_eq!(frame.height(), self.capture_height);

        let (w, h) = (self.capture_width, self.capture_height);
        let plane_dims = [(0, w, h), (w * h, w / 2, h / 2), (w * h + w * h / 4, w / 2, h / 2)];

        match self.axis {
            FlipAxis::None => {}
            FlipAxis::Horizontal => {
                let data = frame.planes_mut();
                for &(off, pw, ph) in &plane_dims {
                    flip_horizontal(&mut data[off..off + pw * ph], pw, ph);
                }
            }
            FlipAxis::Vertical => {
                let data = frame.planes_mut();
                for &(off, pw, ph) in &plane_dims {
                    flip_vertical(&mut data[off..off + pw * ph], pw, ph);
                }
            }
        }

        match self.degrees {
            0 => {}
            180 => {
                let data = frame.planes_mut();
                for &(off, pw, ph) in &plane_dims {
                    reverse_inplace_quad(&mut data[off..off + pw * ph]);
                }
            }
            90 | 270 => {
                let mut rotated = vec![0u8; frame.planes().len()];
                {
                    let src = frame.planes();
                    let mut dst_off = 0;
                    for &(off, pw, ph) in &plane_dims {
                        let sp = &src[off..off + pw * ph];
                        let dp = &mut rotated[dst_off..dst_off + pw * ph];
                        if self.degrees == 90 {
                            rot90cw(sp, dp, pw, ph);
                        } else {
                            rot90ccw(sp, dp, pw, ph);
                        }
                        dst_off += pw * ph;
                    }
                }
                frame.replace_geometry(h, w, rotated);
            }
            _ => unreachable!(),
        }
    }
}

/// Reverses a plane in place, four bytes at a time.
fn reverse_inplace_quad(buf: &mut [u8]) {
    debug_assert_eq!(buf.len() % 4, 0);
    let quads = buf.len() / 4;
    let mut lo = 0;
    let mut hi = quads - 1;
    while lo < hi {
        let a = load_quad(buf, lo).swap_bytes();
        let b = load_quad(buf, hi).swap_bytes();
        store_quad(buf, lo, b);
        store_quad(buf, hi, a);
        lo += 1;
        hi -= 1;
    }
    if lo == hi {
        let m = load_quad(buf, lo).swap_bytes();
        store_quad(buf, lo, m);
    }
}

fn load_quad(buf: &[u8], i: usize) -> u32 {
    u32::from_ne_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap())
}

fn store_quad(buf: &mut [u8], i: usize, v: u32) {
    buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
}

/// Top and bottom rows trade places.
fn flip_horizontal(buf: &mut [u8], width: usize, height: usize) {
    for row in 0..height / 2 {
        let (top, rest) = buf.split_at_mut((height - row - 1) * width);
        top[row * width..row * width + width].swap_with_slice(&mut rest[..width]);
    }
}

/// Each row is mirrored.
fn flip_vertical(buf: &mut [u8], width: usize, height: usize) {
    for row in 0..height {
        buf[row * width..(row + 1) * width].reverse();
    }
}

fn rot90cw(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    for y in 0..height {
        for x in 0..width {
            dst[x * height + (height - 1 - y)] = src[y * width + x];
        }
    }
}

fn rot90ccw(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    for y in 0..height {
        for x in 0..width {
            dst[(width - 1 - x) * height + y] = src[y * width + x];
        }
    }
}

/// Nearest-neighbour 2x2 subsample for the sub-stream. Returns `None` when
/// either dimension is not a multiple of 16, in which case the caller
/// forwards the original image.
pub fn scale_half(src: &Frame) -> Option<Frame> {
    let (w, h) = (src.width(), src.height());
    if w % 16 != 0 || h % 16 != 0 {
        return None;
    }
    let (hw, hh) = (w / 2, h / 2);
    let mut data = vec![0u8; hw * hh * 3 / 2];

    let plane_dims = [(0usize, w, h, 0usize), (w * h, w / 2, h / 2, hw * hh), (
        w * h + w * h / 4,
        w / 2,
        h / 2,
        hw * hh + hw * hh / 4,
    )];
    let sdata = src.planes();
    for &(soff, pw, ph, doff) in &plane_dims {
        for y in 0..ph / 2 {
            for x in 0..pw / 2 {
                data[doff + y * (pw / 2) + x] = sdata[soff + (y * 2) * pw + x * 2];
            }
        }
    }

    let mut out = Frame::from_yuv420(hw, hh, data, src.index, src.timestamp).ok()?;
    out.high = None;
    Some(out)
}
