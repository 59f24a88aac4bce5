//! The per-camera detection model: reference frame, per-pixel age state,
//! learned smartmask, noise/threshold auto-tuners and the lightswitch
//! heuristic. One [`DetectionModel::process`] call per captured frame.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::frame::{DiffResult, Frame, FrameVerdict, Location};
use crate::pixel::{self, despeckle::despeckle, KernelPath, RefAction};

pub const NOISE_MIN: u8 = 2;
pub const NOISE_MAX: u8 = 64;
/// Accumulator ceiling; a pixel pinned here is suppressed by the smartmask.
pub const SMARTMASK_SENSITIVITY: u8 = 20;

const NOISE_SAMPLE_SIZE: usize = 256;
const THRESHOLD_TUNE_WINDOW: usize = 60;

/// Detection parameters, delivered fully populated by the configuration
/// layer.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub width: usize,
    pub height: usize,
    /// Per-pixel difference threshold; auto-tuned when `noise_tune` is on.
    pub noise_level: u8,
    pub noise_tune: bool,
    /// Changed-pixel count above which a frame counts as motion.
    pub threshold: usize,
    pub threshold_tune: bool,
    pub threshold_minimum: usize,
    /// Despeckle recipe, e.g. `"EedDl"`. Empty disables the stage.
    pub despeckle_filter: String,
    /// Smallest connected component the `l` step keeps.
    pub label_min_pixels: usize,
    /// Whole-frame change percentage that triggers lightswitch handling;
    /// 0 disables the heuristic.
    pub lightswitch_percent: usize,
    /// Frames spent rebuilding the reference after a lightswitch.
    pub lightswitch_frames: usize,
    /// Smartmask decay per quiet frame; 0 disables the smartmask.
    pub smart_mask_speed: u8,
    /// Effective capture rate, used for the static-object accept timer and
    /// the smartmask rebuild cadence.
    pub framerate: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            width: 640,
            height: 480,
            noise_level: 32,
            noise_tune: false,
            threshold: 1500,
            threshold_tune: false,
            threshold_minimum: 1500,
            despeckle_filter: String::new(),
            label_min_pixels: 1,
            lightswitch_percent: 0,
            lightswitch_frames: 5,
            smart_mask_speed: 0,
            framerate: 15,
        }
    }
}

pub struct DetectionModel {
    conf: DetectionConfig,
    path: KernelPath,
    reference: Vec<u8>,
    ref_age: Vec<u16>,
    smartmask_accum: Vec<u8>,
    smartmask_final: Vec<u8>,
    privacy_mask: Option<Vec<u8>>,
    fixed_mask: Option<Vec<u8>>,
    scratch: Vec<u8>,
    noise: u8,
    threshold: usize,
    accept_timer: u16,
    diff_window: Vec<usize>,
    lightswitch_remaining: usize,
    frames_seen: u64,
    primed: bool,
    rng: StdRng,
}

impl DetectionModel {
    pub fn new(conf: DetectionConfig) -> Self {
        let pixels = conf.width * conf.height;
        let noise = conf.noise_level.clamp(NOISE_MIN, NOISE_MAX);
        let threshold = conf.threshold.max(1);
        let accept_timer = pixel::accept_timer(conf.framerate.max(1));
        let path = KernelPath::detect();
        debug!(
            "detection model {}x{} using {:?} kernels, accept timer {} ticks",
            conf.width, conf.height, path, accept_timer
        );
        DetectionModel {
            path,
            reference: vec![0; pixels],
            ref_age: vec![0; pixels],
            smartmask_accum: vec![0; pixels],
            smartmask_final: vec![255; pixels],
            privacy_mask: None,
            fixed_mask: None,
            scratch: vec![0; pixels],
            noise,
            threshold,
            accept_timer,
            diff_window: Vec::with_capacity(THRESHOLD_TUNE_WINDOW),
            lightswitch_remaining: 0,
            frames_seen: 0,
            primed: false,
            rng: StdRng::seed_from_u64(0x9e37_79b9_7f4a_7c15),
            conf,
        }
    }

    /// Installs a privacy mask (0 = masked out). A load failure upstream is
    /// signalled by passing `None`, which makes the mask all-pass.
    pub fn set_privacy_mask(&mut self, mask: Option<Vec<u8>>) {
        debug_assert!(mask
            .as_ref()
            .map_or(true, |m| m.len() == self.reference.len()));
        self.privacy_mask = mask;
    }

    pub fn set_fixed_mask(&mut self, mask: Option<Vec<u8>>) {
        debug_assert!(mask
            .as_ref()
            .map_or(true, |m| m.len() == self.reference.len()));
        self.fixed_mask = mask;
    }

    pub fn noise(&self) -> u8 {
        self.noise
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn reference(&self) -> &[u8] {
        &self.reference
    }

    pub fn ref_age(&self) -> &[u16] {
        &self.ref_age
    }

    pub fn smartmask_final(&self) -> &[u8] {
        &self.smartmask_final
    }

    pub fn fixed_mask(&self) -> Option<&[u8]> {
        self.fixed_mask.as_deref()
    }

    /// Runs the full detection stage for one frame.
    pub fn process(&mut self, frame: &Frame) -> (FrameVerdict, DiffResult) {
        assert_eq!(frame.width(), self.conf.width);
        assert_eq!(frame.height(), self.conf.height);
        let pixels = frame.pixels();
        self.frames_seen += 1;

        let mut out = vec![0u8; pixels];

        // First frame just seeds the reference.
        if !self.primed {
            pixel::update_reference(
                self.path,
                RefAction::Reset,
                &mut self.reference,
                &mut self.ref_age,
                frame.y(),
                &self.smartmask_final,
                &out,
                self.noise,
                self.accept_timer,
            );
            self.primed = true;
            return (
                FrameVerdict::quiet(self.noise, self.threshold),
                DiffResult {
                    out,
                    diffs: 0,
                    labels: None,
                },
            );
        }

        // Frames inside the lightswitch window only rebuild the reference.
        if self.lightswitch_remaining > 0 {
            self.lightswitch_remaining -= 1;
            pixel::update_reference(
                self.path,
                RefAction::Reset,
                &mut self.reference,
                &mut self.ref_age,
                frame.y(),
                &self.smartmask_final,
                &out,
                self.noise,
                self.accept_timer,
            );
            let mut verdict = FrameVerdict::quiet(self.noise, self.threshold);
            verdict.lightswitch = true;
            return (
                verdict,
                DiffResult {
                    out,
                    diffs: 0,
                    labels: None,
                },
            );
        }

        let mut diffs =
            pixel::threshold_diff(self.path, &self.reference, frame.y(), self.noise, &mut out);

        if self.conf.smart_mask_speed > 0 {
            diffs = pixel::apply_mask(&mut out, &self.smartmask_final);
        }
        if let Some(mask) = &self.privacy_mask {
            diffs = pixel::apply_mask(&mut out, mask);
        }
        if let Some(mask) = &self.fixed_mask {
            diffs = pixel::apply_mask(&mut out, mask);
        }

        let mut labels = None;
        if !self.conf.despeckle_filter.is_empty() {
            let (d, l) = despeckle(
                &mut out,
                &mut self.scratch,
                self.conf.width,
                self.conf.height,
                &self.conf.despeckle_filter,
                self.conf.label_min_pixels,
            );
            diffs = d;
            labels = l;
        }

        // Whole-frame illumination change: suppress and rebuild.
        if self.conf.lightswitch_percent > 0
            && diffs * 100 / pixels >= self.conf.lightswitch_percent
        {
            info!(
                "lightswitch detected ({} of {} pixels changed)",
                diffs, pixels
            );
            self.lightswitch_remaining = self.conf.lightswitch_frames;
            pixel::update_reference(
                self.path,
                RefAction::Reset,
                &mut self.reference,
                &mut self.ref_age,
                frame.y(),
                &self.smartmask_final,
                &out,
                self.noise,
                self.accept_timer,
            );
            out.fill(0);
            let mut verdict = FrameVerdict::quiet(self.noise, self.threshold);
            verdict.lightswitch = true;
            return (
                verdict,
                DiffResult {
                    out,
                    diffs: 0,
                    labels: None,
                },
            );
        }

        let motion = diffs > self.threshold;

        if self.conf.noise_tune && !motion {
            self.tune_noise(frame.y());
        }
        if self.conf.threshold_tune {
            self.tune_threshold(diffs);
        }
        if self.conf.smart_mask_speed > 0 {
            self.update_smartmask(&out);
        }

        pixel::update_reference(
            self.path,
            RefAction::Update,
            &mut self.reference,
            &mut self.ref_age,
            frame.y(),
            &self.smartmask_final,
            &out,
            self.noise,
            self.accept_timer,
        );

        let location = match &labels {
            Some(info) if info.largest_label != 0 => Some(info.location),
            _ if diffs > 0 => bounding_box(&out, self.conf.width, self.conf.height),
            _ => None,
        };

        let verdict = FrameVerdict {
            changed_pixels: diffs,
            noise: self.noise,
            threshold: self.threshold,
            lightswitch: false,
            motion_detected: motion,
            location,
            total_labels: labels.as_ref().map_or(0, |l| l.total_labels),
        };
        (verdict, DiffResult { out, diffs, labels })
    }

    /// EWMA of a sparse percentile estimate of the plane noise.
    fn tune_noise(&mut self, virgin: &[u8]) {
        let mut sample = [0u8; NOISE_SAMPLE_SIZE];
        for s in sample.iter_mut() {
            let i = self.rng.gen_range(0..virgin.len());
            *s = self.reference[i].abs_diff(virgin[i]);
        }
        sample.sort_unstable();
        let measured = sample[NOISE_SAMPLE_SIZE * 3 / 4];
        let blended =
            (7 * u32::from(self.noise) + u32::from(measured) + 4) / 8;
        self.noise = (blended as u8).clamp(NOISE_MIN, NOISE_MAX);
    }

    /// Shrinks the threshold when a whole window of diffs stays well below
    /// it; never below the configured minimum.
    fn tune_threshold(&mut self, diffs: usize) {
        self.diff_window.push(diffs);
        if self.diff_window.len() < THRESHOLD_TUNE_WINDOW {
            return;
        }
        let window_max = self.diff_window.iter().copied().max().unwrap_or(0);
        self.diff_window.clear();
        if window_max * 2 < self.threshold {
            let shrunk = (self.threshold * 9 / 10).max(self.conf.threshold_minimum).max(1);
            if shrunk != self.threshold {
                debug!("threshold tuned {} -> {}", self.threshold, shrunk);
                self.threshold = shrunk;
            }
        }
    }

    /// Pixels that keep showing up in the difference image accumulate until
    /// the smartmask suppresses them; quiet pixels decay back at the
    /// configured speed. The binary mask is rebuilt about once a second.
    fn update_smartmask(&mut self, out: &[u8]) {
        let speed = self.conf.smart_mask_speed;
        for (accum, &o) in self.smartmask_accum.iter_mut().zip(out.iter()) {
            if o != 0 {
                *accum = (*accum + 1).min(SMARTMASK_SENSITIVITY);
            } else {
                *accum = accum.saturating_sub(speed);
            }
        }

        let period = u64::from(self.conf.framerate.max(1));
        if self.frames_seen % period == 0 {
            for (f, &accum) in self.smartmask_final.iter_mut().zip(self.smartmask_accum.iter()) {
                *f = if accum < SMARTMASK_SENSITIVITY { 255 } else { 0 };
            }
        }
    }
}

/// Bounding box of all set pixels; used when no labelling ran.
fn bounding_box(out: &[u8], width: usize, height: usize) -> Option<Location> {
    let mut minx = width;
    let mut maxx = 0;
    let mut miny = height;
    let mut maxy = 0;
    for y in 0..height {
        let row = &out[y * width..(y + 1) * width];
        for (x, &p) in row.iter().enumerate() {
            if p != 0 {
                minx = minx.min(x);
                maxx = maxx.max(x);
                miny = miny.min(y);
                maxy = maxy.max(y);
            }
        }
    }
    if minx > maxx {
        None
    } else {
        Some(Location::from_bounds(minx, maxx, miny, maxy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Timestamp;

    fn flat_frame(w: usize, h: usize, luma: u8, index: u64) -> Frame {
        let mut data = vec![luma; w * h * 3 / 2];
        for b in data[w * h..].iter_mut() {
            *b = 128;
        }
        Frame::from_yuv420(
            w,
            h,
            data,
            index,
            Timestamp {
                sec: index as i64 / 10,
                usec: (index as u32 % 10) * 100_000,
            },
        )
        .unwrap()
    }

    #[test]
    fn static_scene_stays_quiet() {
        let conf = DetectionConfig {
            width: 64,
            height: 48,
            ..DetectionConfig::default()
        };
        let mut model = DetectionModel::new(conf);
        for i in 0..50 {
            let (verdict, diff) = model.process(&flat_frame(64, 48, 128, i));
            assert_eq!(verdict.changed_pixels, 0);
            assert!(!verdict.motion_detected);
            assert_eq!(diff.diffs, 0);
        }
        assert!(model.ref_age().iter().all(|&a| a == 0));
    }

    #[test]
    fn block_change_is_located() {
        let conf = DetectionConfig {
            width: 64,
            height: 64,
            threshold: 50,
            ..DetectionConfig::default()
        };
        let mut model = DetectionModel::new(conf);
        model.process(&flat_frame(64, 64, 128, 0));

        let mut frame = flat_frame(64, 64, 128, 1);
        for y in 16..32 {
            for x in 16..32 {
                frame.planes_mut()[y * 64 + x] = 220;
            }
        }
        let (verdict, diff) = model.process(&frame);
        assert!(verdict.motion_detected);
        assert_eq!(diff.diffs, 16 * 16);
        let loc = verdict.location.unwrap();
        assert_eq!(loc.width, 16);
        assert_eq!(loc.x, 16 + 8);
    }

    #[test]
    fn lightswitch_suppresses_and_rebuilds() {
        let conf = DetectionConfig {
            width: 32,
            height: 32,
            threshold: 10,
            lightswitch_percent: 50,
            lightswitch_frames: 5,
            ..DetectionConfig::default()
        };
        let mut model = DetectionModel::new(conf);
        model.process(&flat_frame(32, 32, 100, 0));

        let bright = flat_frame(32, 32, 200, 1);
        let (verdict, diff) = model.process(&bright);
        assert!(verdict.lightswitch);
        assert!(!verdict.motion_detected);
        assert_eq!(diff.diffs, 0);
        // The reference adopted the bright frame immediately.
        assert!(model.reference().iter().all(|&r| r == 200));

        // Suppression window still reports no motion.
        for i in 2..7 {
            let (v, _) = model.process(&flat_frame(32, 32, 200, i));
            assert!(v.lightswitch);
            assert!(!v.motion_detected);
        }
        let (v, _) = model.process(&flat_frame(32, 32, 200, 8));
        assert!(!v.lightswitch);
        assert!(model.ref_age().iter().all(|&a| a == 0));
    }

    #[test]
    fn privacy_mask_blocks_masked_half() {
        let (w, h) = (64, 32);
        let conf = DetectionConfig {
            width: w,
            height: h,
            threshold: 10,
            ..DetectionConfig::default()
        };
        let mut model = DetectionModel::new(conf);
        // Right half masked out.
        let mut mask = vec![255u8; w * h];
        for y in 0..h {
            for x in w / 2..w {
                mask[y * w + x] = 0;
            }
        }
        model.set_privacy_mask(Some(mask));
        model.process(&flat_frame(w, h, 128, 0));

        let mut frame = flat_frame(w, h, 128, 1);
        for y in 8..16 {
            for x in 40..48 {
                frame.planes_mut()[y * w + x] = 255;
            }
        }
        let (verdict, _) = model.process(&frame);
        assert_eq!(verdict.changed_pixels, 0);

        let mut frame = flat_frame(w, h, 128, 2);
        for y in 8..16 {
            for x in 8..16 {
                frame.planes_mut()[y * w + x] = 255;
            }
        }
        let (verdict, _) = model.process(&frame);
        assert_eq!(verdict.changed_pixels, 64);
    }

    #[test]
    fn threshold_tune_shrinks_to_minimum() {
        let conf = DetectionConfig {
            width: 32,
            height: 32,
            threshold: 1000,
            threshold_tune: true,
            threshold_minimum: 900,
            ..DetectionConfig::default()
        };
        let mut model = DetectionModel::new(conf);
        for i in 0..200 {
            model.process(&flat_frame(32, 32, 128, i));
        }
        assert_eq!(model.threshold(), 900);
    }
}
