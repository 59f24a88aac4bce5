//! Still-image output: YUV420p to RGB conversion, JPEG/WebP/PPM encoding,
//! the motion-overlay image variant and the snapshot/`lastsnap` symlink
//! contract.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::ExtendedColorType;
use vigil_detection::frame::Frame;
use vigil_detection::pixel::overlay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    Jpeg,
    Webp,
    Ppm,
}

impl PictureType {
    pub fn from_config(s: &str) -> PictureType {
        match s {
            "webp" => PictureType::Webp,
            "ppm" => PictureType::Ppm,
            _ => PictureType::Jpeg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            PictureType::Jpeg => "jpg",
            PictureType::Webp => "webp",
            PictureType::Ppm => "ppm",
        }
    }
}

/// Fixed-point BT.601 conversion of the whole frame to packed RGB.
pub fn yuv_to_rgb(frame: &Frame) -> Vec<u8> {
    let (w, h) = (frame.width(), frame.height());
    let y_plane = frame.y();
    let u_plane = frame.u();
    let v_plane = frame.v();
    let mut rgb = vec![0u8; w * h * 3];
    let uv_stride = w / 2;

    for py in 0..h {
        for px in 0..w {
            let yv = i32::from(y_plane[py * w + px]);
            let uv_index = (py / 2) * uv_stride + px / 2;
            let u = i32::from(u_plane[uv_index]) - 128;
            let v = i32::from(v_plane[uv_index]) - 128;

            // Scaled-by-256 approximations of 1.402 / 0.3441+0.7141 / 1.772.
            let r_off = (359 * v) >> 8;
            let g_off = (88 * u + 183 * v) >> 8;
            let b_off = (453 * u) >> 8;

            let o = (py * w + px) * 3;
            rgb[o] = (yv + r_off).clamp(0, 255) as u8;
            rgb[o + 1] = (yv - g_off).clamp(0, 255) as u8;
            rgb[o + 2] = (yv + b_off).clamp(0, 255) as u8;
        }
    }
    rgb
}

/// Encodes a frame to the configured still format.
pub fn encode(frame: &Frame, ptype: PictureType, quality: u8) -> Result<Vec<u8>> {
    let (w, h) = (frame.width() as u32, frame.height() as u32);
    let rgb = yuv_to_rgb(frame);
    let mut bytes = Vec::new();
    match ptype {
        PictureType::Jpeg => {
            JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
                .encode(&rgb, w, h, ExtendedColorType::Rgb8)
                .context("jpeg encode failed")?;
        }
        PictureType::Webp => {
            WebPEncoder::new_lossless(&mut bytes)
                .encode(&rgb, w, h, ExtendedColorType::Rgb8)
                .context("webp encode failed")?;
        }
        PictureType::Ppm => {
            write!(&mut bytes, "P6\n{} {}\n255\n", w, h)?;
            bytes.extend_from_slice(&rgb);
        }
    }
    Ok(bytes)
}

/// Writes a still to disk, creating parent directories as needed (the
/// filename format may contain path separators).
pub fn write_picture(path: &Path, frame: &Frame, ptype: PictureType, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("could not create {}", parent.display()))?;
    }
    let bytes = encode(frame, ptype, quality)?;
    fs::write(path, bytes).with_context(|| format!("could not write {}", path.display()))?;
    Ok(())
}

/// Writes a snapshot and repoints the `lastsnap.<ext>` symlink at it. The
/// link is replaced only after the image write succeeded so it always
/// names a valid file; a snapshot filename that itself ends in "lastsnap"
/// skips the link.
pub fn write_snapshot(
    target_dir: &Path,
    stem: &str,
    frame: &Frame,
    ptype: PictureType,
    quality: u8,
) -> Result<PathBuf> {
    let fname = format!("{}.{}", stem, ptype.extension());
    let full = target_dir.join(&fname);
    write_picture(&full, frame, ptype, quality)?;

    if !stem.ends_with("lastsnap") {
        let link = target_dir.join(format!("lastsnap.{}", ptype.extension()));
        let _ = fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&fname, &link) {
            error!("could not create symbolic link {:?}: {e}", link);
        }
    }
    Ok(full)
}

/// Builds the motion-overlay image: the binary difference as luma with the
/// smartmask (red), fixed mask (green) and dominant label (blue) stamped
/// into the chroma planes.
pub fn motion_image(
    diff_out: &[u8],
    width: usize,
    height: usize,
    smartmask: Option<&[u8]>,
    fixed_mask: Option<&[u8]>,
    labels: Option<(&[u32], u32)>,
) -> Frame {
    let mut frame = Frame::blank(width, height).expect("motion image dimensions");
    frame.planes_mut()[..width * height].copy_from_slice(diff_out);
    if let Some(mask) = smartmask {
        overlay::overlay_smartmask(&mut frame, mask);
    }
    if let Some(mask) = fixed_mask {
        overlay::overlay_fixed_mask(&mut frame, mask);
    }
    if let Some((labels, largest)) = labels {
        overlay::overlay_largest_label(&mut frame, labels, largest);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "vigil-{}-{}-{}",
            tag,
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn grey_frame_converts_to_grey_rgb() {
        let mut f = Frame::blank(16, 16).unwrap();
        f.planes_mut()[..256].fill(100);
        let rgb = yuv_to_rgb(&f);
        assert_eq!(rgb.len(), 16 * 16 * 3);
        assert_eq!(&rgb[..3], &[100, 100, 100]);
    }

    #[test]
    fn ppm_has_header_and_payload() {
        let f = Frame::blank(16, 8).unwrap();
        let bytes = encode(&f, PictureType::Ppm, 75).unwrap();
        assert!(bytes.starts_with(b"P6\n16 8\n255\n"));
        assert_eq!(bytes.len(), 12 + 16 * 8 * 3);
    }

    #[test]
    fn jpeg_encodes_nonempty() {
        let f = Frame::blank(32, 32).unwrap();
        let bytes = encode(&f, PictureType::Jpeg, 75).unwrap();
        assert!(bytes.len() > 100);
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn snapshot_updates_lastsnap_symlink() {
        let dir = temp_dir("snap");
        let f = Frame::blank(16, 16).unwrap();

        let p1 = write_snapshot(&dir, "snap-001", &f, PictureType::Jpeg, 75).unwrap();
        let link = dir.join("lastsnap.jpg");
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("snap-001.jpg"));

        let p2 = write_snapshot(&dir, "snap-002", &f, PictureType::Jpeg, 75).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("snap-002.jpg"));
        assert!(p1.exists() && p2.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn lastsnap_stem_skips_link() {
        let dir = temp_dir("lastsnap");
        let f = Frame::blank(16, 16).unwrap();
        write_snapshot(&dir, "lastsnap", &f, PictureType::Jpeg, 75).unwrap();
        assert!(dir.join("lastsnap.jpg").exists());
        assert!(fs::read_link(dir.join("lastsnap.jpg")).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn motion_image_carries_diff_and_overlays() {
        let (w, h) = (16, 16);
        let mut out = vec![0u8; w * h];
        out[0] = 255;
        let mut mask = vec![255u8; w * h];
        mask[4] = 0;
        let img = motion_image(&out, w, h, None, Some(&mask), None);
        assert_eq!(img.y()[0], 255);
        assert_eq!(img.y()[4], 0);
        assert_eq!(img.u()[2], 0); // green tint where the mask excludes
    }
}
