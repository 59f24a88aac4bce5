//! Binary PGM (P5) masks.
//!
//! User-supplied privacy and fixed masks are greyscale PGM files: zero
//! pixels are ignored entirely, anything else is active. Files whose
//! dimensions do not match the camera are resized nearest-neighbour with a
//! warning. The writer emits the canonical form the loader accepts, so a
//! matching-size mask round-trips byte-identically.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::warn;

use crate::DetectionError;

/// Loads a mask and scales/resizes it to `width` x `height`.
pub fn load_pgm(path: &Path, width: usize, height: usize) -> Result<Vec<u8>, DetectionError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_pgm(&mut reader, width, height)
}

/// Reader-based loader, split out for tests.
pub fn read_pgm<R: BufRead>(
    reader: &mut R,
    width: usize,
    height: usize,
) -> Result<Vec<u8>, DetectionError> {
    let magic = read_header_line(reader)?;
    if !magic.starts_with("P5") {
        return Err(DetectionError::NotPgm);
    }

    let dims = read_header_line(reader)?;
    let mut parts = dims.split_whitespace();
    let mask_width: usize = parts
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| DetectionError::PgmHeader("missing width".into()))?;
    let mask_height: usize = parts
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| DetectionError::PgmHeader("missing height".into()))?;
    if mask_width == 0 || mask_height == 0 {
        return Err(DetectionError::PgmHeader("zero dimension".into()));
    }

    let maxval: u32 = read_header_line(reader)?
        .trim()
        .parse()
        .map_err(|_| DetectionError::PgmHeader("missing maxval".into()))?;
    if maxval == 0 || maxval > 255 {
        return Err(DetectionError::PgmMaxval(maxval));
    }

    let mut image = vec![0u8; mask_width * mask_height];
    reader.read_exact(&mut image)?;

    // Normalize to full range so "nonzero means active" holds regardless
    // of the file's maxval.
    if maxval != 255 {
        for px in image.iter_mut() {
            *px = (u32::from(*px) * 255 / maxval) as u8;
        }
    }

    if mask_width != width || mask_height != height {
        warn!(
            "mask is {}x{} but the camera image is {}x{}, resizing",
            mask_width, mask_height, width, height
        );
        let mut resized = vec![0u8; width * height];
        for y in 0..height {
            let sy = (mask_height - 1) * y / (height - 1);
            for x in 0..width {
                let sx = (mask_width - 1) * x / (width - 1);
                resized[y * width + x] = image[sy * mask_width + sx];
            }
        }
        image = resized;
    }

    Ok(image)
}

/// Skips `#` comment lines and returns the next header line, trimmed of
/// the trailing newline.
fn read_header_line<R: BufRead>(reader: &mut R) -> Result<String, DetectionError> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(DetectionError::PgmHeader("unexpected end of file".into()));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.starts_with('#') {
            continue;
        }
        return Ok(trimmed.to_string());
    }
}

/// Writes a mask in the canonical form: used for exporting the learned
/// smartmask so it can be reviewed or promoted to a fixed mask.
pub fn write_pgm(
    path: &Path,
    data: &[u8],
    width: usize,
    height: usize,
) -> Result<(), DetectionError> {
    assert_eq!(data.len(), width * height);
    let mut out = BufWriter::new(File::create(path)?);
    serialize_pgm(&mut out, data, width, height)?;
    out.flush()?;
    Ok(())
}

pub fn serialize_pgm<W: Write>(
    out: &mut W,
    data: &[u8],
    width: usize,
    height: usize,
) -> Result<(), DetectionError> {
    write!(out, "P5\n{} {}\n255\n", width, height)?;
    out.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn matching_size_round_trips_byte_identically() {
        let (w, h) = (16, 8);
        let data: Vec<u8> = (0..w * h).map(|i| (i % 256) as u8).collect();
        let mut bytes = Vec::new();
        serialize_pgm(&mut bytes, &data, w, h).unwrap();

        let loaded = read_pgm(&mut Cursor::new(&bytes), w, h).unwrap();
        let mut again = Vec::new();
        serialize_pgm(&mut again, &loaded, w, h).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn comments_and_maxval_scaling() {
        let mut bytes = b"P5\n# produced by hand\n4 2\n# another comment\n15\n".to_vec();
        bytes.extend_from_slice(&[0, 15, 7, 15, 0, 0, 15, 1]);
        let loaded = read_pgm(&mut Cursor::new(&bytes), 4, 2).unwrap();
        assert_eq!(loaded[0], 0);
        assert_eq!(loaded[1], 255);
        assert_eq!(loaded[2], (7i32 * 255 / 15) as u8);
    }

    #[test]
    fn mismatched_dimensions_are_resized() {
        let (mw, mh) = (8, 8);
        // Left half black, right half white.
        let mut data = vec![0u8; mw * mh];
        for y in 0..mh {
            for x in mw / 2..mw {
                data[y * mw + x] = 255;
            }
        }
        let mut bytes = Vec::new();
        serialize_pgm(&mut bytes, &data, mw, mh).unwrap();

        let loaded = read_pgm(&mut Cursor::new(&bytes), 16, 16).unwrap();
        assert_eq!(loaded.len(), 16 * 16);
        assert_eq!(loaded[0], 0);
        assert_eq!(loaded[15], 255);
    }

    #[test]
    fn rejects_non_pgm() {
        let bytes = b"P6\n4 2\n255\n".to_vec();
        assert!(matches!(
            read_pgm(&mut Cursor::new(&bytes), 4, 2),
            Err(DetectionError::NotPgm)
        ));
    }
}
