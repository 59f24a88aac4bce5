//! Despeckle recipe interpreter.
//!
//! The configured filter is a short string of one-character operations
//! applied left-to-right to the binary difference image: `E`/`e` erode
//! (3x3 box / cross), `D`/`d` dilate (box / cross), `l` label connected
//! components and keep only those of at least the configured size. Unknown
//! characters are ignored with a warning.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use log::warn;

use crate::frame::{LabelInfo, Location};

const BOX_OFFSETS: [(isize, isize); 9] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (0, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

const CROSS_OFFSETS: [(isize, isize); 5] = [(0, -1), (-1, 0), (0, 0), (1, 0), (0, 1)];

/// Runs `recipe` over `out` in place. `scratch` must be the same size as
/// `out`. Returns the resulting set-pixel count and, when the recipe
/// contained `l`, the labelling summary.
pub fn despeckle(
    out: &mut [u8],
    scratch: &mut [u8],
    width: usize,
    height: usize,
    recipe: &str,
    min_label_pixels: usize,
) -> (usize, Option<LabelInfo>) {
    assert_eq!(out.len(), width * height);
    assert_eq!(scratch.len(), out.len());

    let mut diffs = out.iter().filter(|&&p| p != 0).count();
    let mut labels = None;

    for op in recipe.chars() {
        match op {
            'E' => diffs = morph(out, scratch, width, height, false, true),
            'e' => diffs = morph(out, scratch, width, height, true, true),
            'D' => diffs = morph(out, scratch, width, height, false, false),
            'd' => diffs = morph(out, scratch, width, height, true, false),
            'l' => {
                let info = label(out, width, height, min_label_pixels);
                diffs = out.iter().filter(|&&p| p != 0).count();
                labels = Some(info);
            }
            _ => warn!("ignoring unknown despeckle operation {:?}", op),
        }
    }

    (diffs, labels)
}

/// One erosion or dilation pass. `cross` restricts the structuring element
/// to the 4-neighbourhood; pixels outside the frame count as unset, so a
/// full-box erosion always strips the outermost ring.
fn morph(
    out: &mut [u8],
    scratch: &mut [u8],
    width: usize,
    height: usize,
    cross: bool,
    erode: bool,
) -> usize {
    let offsets: &[(isize, isize)] = if cross { &CROSS_OFFSETS } else { &BOX_OFFSETS };
    let mut diffs = 0;

    for y in 0..height as isize {
        for x in 0..width as isize {
            let mut set = erode;
            for &(dx, dy) in offsets {
                let (nx, ny) = (x + dx, y + dy);
                let inside = nx >= 0 && nx < width as isize && ny >= 0 && ny < height as isize;
                let on = inside && out[(ny as usize) * width + nx as usize] != 0;
                if erode {
                    set &= on;
                } else {
                    set |= on;
                }
            }
            scratch[(y as usize) * width + x as usize] = if set { 255 } else { 0 };
            if set {
                diffs += 1;
            }
        }
    }

    out.copy_from_slice(scratch);
    diffs
}

/// 8-connected component labelling with an explicit stack. Components
/// smaller than `min_pixels` are erased from `out`; the survivors keep
/// their ids and the dominant one provides the bounding box.
fn label(out: &mut [u8], width: usize, height: usize, min_pixels: usize) -> LabelInfo {
    let min_pixels = min_pixels.max(1);
    let mut labels = vec![0u32; out.len()];
    let mut sizes: Vec<usize> = vec![0]; // index 0 = background
    let mut bounds: Vec<(usize, usize, usize, usize)> = vec![(0, 0, 0, 0)];
    let mut stack: Vec<usize> = Vec::new();

    for seed in 0..out.len() {
        if out[seed] == 0 || labels[seed] != 0 {
            continue;
        }
        let id = sizes.len() as u32;
        let mut size = 0usize;
        let (mut minx, mut maxx, mut miny, mut maxy) =
            (width - 1, 0usize, height - 1, 0usize);

        labels[seed] = id;
        stack.push(seed);
        while let Some(p) = stack.pop() {
            size += 1;
            let (px, py) = (p % width, p / width);
            minx = minx.min(px);
            maxx = maxx.max(px);
            miny = miny.min(py);
            maxy = maxy.max(py);

            for &(dx, dy) in BOX_OFFSETS.iter() {
                let (nx, ny) = (px as isize + dx, py as isize + dy);
                if nx < 0 || nx >= width as isize || ny < 0 || ny >= height as isize {
                    continue;
                }
                let n = (ny as usize) * width + nx as usize;
                if out[n] != 0 && labels[n] == 0 {
                    labels[n] = id;
                    stack.push(n);
                }
            }
        }

        sizes.push(size);
        bounds.push((minx, maxx, miny, maxy));
    }

    // Drop runt components below the minimum size.
    let keep: Vec<bool> = sizes.iter().map(|&s| s >= min_pixels).collect();
    let mut largest_label = 0u32;
    let mut largest_pixels = 0usize;
    let mut total = 0usize;
    for (id, &size) in sizes.iter().enumerate().skip(1) {
        if !keep[id] {
            continue;
        }
        total += 1;
        if size > largest_pixels {
            largest_pixels = size;
            largest_label = id as u32;
        }
    }

    for (o, l) in out.iter_mut().zip(labels.iter_mut()) {
        if *l != 0 && !keep[*l as usize] {
            *o = 0;
            *l = 0;
        }
    }

    let location = if largest_label != 0 {
        let (minx, maxx, miny, maxy) = bounds[largest_label as usize];
        Location::from_bounds(minx, maxx, miny, maxy)
    } else {
        Location::default()
    };

    LabelInfo {
        labels,
        total_labels: total,
        largest_label,
        largest_label_pixels: largest_pixels,
        location,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(recipe: &str, out: &mut [u8], w: usize, h: usize) -> (usize, Option<LabelInfo>) {
        let mut scratch = vec![0u8; out.len()];
        despeckle(out, &mut scratch, w, h, recipe, 1)
    }

    #[test]
    fn erode_then_dilate_restores_all_ones() {
        let (w, h) = (16, 16);
        let mut out = vec![255u8; w * h];
        let (diffs, _) = run("ED", &mut out, w, h);
        assert_eq!(diffs, w * h);
        assert!(out.iter().all(|&p| p == 255));
    }

    #[test]
    fn recipe_is_idempotent_on_replay() {
        let (w, h) = (24, 16);
        let mut out = vec![0u8; w * h];
        // An L-shaped blob plus an isolated speck.
        for y in 4..12 {
            for x in 4..10 {
                out[y * w + x] = 255;
            }
        }
        out[2 * w + 20] = 255;

        let mut first = out.clone();
        let mut scratch = vec![0u8; w * h];
        let (d1, _) = despeckle(&mut first, &mut scratch, w, h, "EedD", 1);
        let mut second = first.clone();
        let (d2, _) = despeckle(&mut second, &mut scratch, w, h, "EedD", 1);
        let mut third = second.clone();
        let (d3, _) = despeckle(&mut third, &mut scratch, w, h, "EedD", 1);
        assert_eq!(d2, d3);
        assert_eq!(second, third);
        let _ = d1;
    }

    #[test]
    fn erode_removes_single_speck() {
        let (w, h) = (16, 8);
        let mut out = vec![0u8; w * h];
        out[3 * w + 5] = 255;
        let (diffs, _) = run("E", &mut out, w, h);
        assert_eq!(diffs, 0);
    }

    #[test]
    fn labelling_finds_dominant_component() {
        let (w, h) = (32, 32);
        let mut out = vec![0u8; w * h];
        for y in 8..16 {
            for x in 8..16 {
                out[y * w + x] = 255;
            }
        }
        out[30 * w + 30] = 255;

        let mut scratch = vec![0u8; w * h];
        let (diffs, labels) = despeckle(&mut out, &mut scratch, w, h, "l", 4);
        let info = labels.unwrap();
        assert_eq!(diffs, 64);
        assert_eq!(info.total_labels, 1);
        assert_eq!(info.largest_label_pixels, 64);
        assert_eq!(info.location.width, 8);
        assert_eq!(info.location.height, 8);
        assert_eq!(info.location.x, 8 + 4);
        // The lone speck was below the minimum and got erased.
        assert_eq!(out[30 * w + 30], 0);
    }

    #[test]
    fn unknown_characters_are_ignored(){
        let (w, h) = (8, 8);
        let mut out = vec![255u8; w * h];
        let (diffs, labels) = run("xyz", &mut out, w, h);
        assert_eq!(diffs, w * h);
        assert!(labels.is_none());
    }
}
