//! Per-camera configuration, loaded from `cameras.yaml`.
//!
//! Every field has a default so a minimal file only needs a name; the
//! loader delivers fully-populated structs to the camera loop, and a bad
//! file is fatal for that camera only.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use vigil_detection::event::EventConfig;
use vigil_detection::model::DetectionConfig;
use vigil_detection::pixel::rotate::FlipAxis;

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    pub camera_id: u32,
    /// Capture source; currently only the built-in "synthetic" test
    /// pattern ships with the hub, real drivers plug in at the Capture
    /// trait.
    pub source: String,
    pub width: usize,
    pub height: usize,
    pub framerate: u32,
    /// Lower bound on the frame interval, seconds; 0 means framerate
    /// pacing only.
    pub minimum_frame_time: f64,
    pub target_dir: String,

    // Detection.
    pub threshold: usize,
    pub threshold_tune: bool,
    pub threshold_minimum: usize,
    pub noise_level: u8,
    pub noise_tune: bool,
    pub despeckle_filter: String,
    pub label_min_pixels: usize,
    pub lightswitch_percent: usize,
    pub lightswitch_frames: usize,
    pub smart_mask_speed: u8,
    pub rotate: i32,
    /// "none", "horizontal" or "vertical".
    pub flip_axis: String,
    pub mask_file: String,
    pub mask_privacy: String,

    // Events.
    pub minimum_motion_frames: usize,
    /// Seconds of quiet that end an event.
    pub event_gap: u64,
    pub pre_capture: usize,
    pub post_capture: usize,
    pub emulate_motion: bool,
    /// Digits 1-9 of the 3x3 grid that arm on_area_detected.
    pub area_detect: String,
    pub text_event: String,

    // Pictures.
    pub picture_output: bool,
    /// Also write the motion-overlay image variant.
    pub picture_output_motion: bool,
    /// "jpeg", "webp" or "ppm".
    pub picture_type: String,
    pub picture_quality: u8,
    pub picture_filename: String,

    // Movies.
    pub movie_output: bool,
    pub movie_filename: String,
    /// External encoder command line; when set it replaces the built-in
    /// spool writer and receives raw frames on stdin.
    pub movie_extpipe: String,

    // Time-lapse.
    pub timelapse_interval: u64,
    /// "daily", "hourly", "manual", "continuous" or "event".
    pub timelapse_mode: String,
    pub timelapse_filename: String,

    // Snapshots.
    pub snapshot_interval: u64,
    pub snapshot_filename: String,

    // Hook scripts.
    pub on_event_start: String,
    pub on_event_end: String,
    pub on_motion_detected: String,
    pub on_area_detected: String,
    pub on_picture_save: String,
    pub on_movie_start: String,
    pub on_movie_end: String,
    pub on_camera_lost: String,
    pub on_camera_found: String,

    // Watchdog.
    pub watchdog_tmo: u64,
    pub watchdog_kill: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            name: "camera".to_string(),
            camera_id: 0,
            source: "synthetic".to_string(),
            width: 640,
            height: 480,
            framerate: 15,
            minimum_frame_time: 0.0,
            target_dir: ".".to_string(),
            threshold: 1500,
            threshold_tune: false,
            threshold_minimum: 1500,
            noise_level: 32,
            noise_tune: true,
            despeckle_filter: String::new(),
            label_min_pixels: 1,
            lightswitch_percent: 0,
            lightswitch_frames: 5,
            smart_mask_speed: 0,
            rotate: 0,
            flip_axis: "none".to_string(),
            mask_file: String::new(),
            mask_privacy: String::new(),
            minimum_motion_frames: 1,
            event_gap: 60,
            pre_capture: 0,
            post_capture: 0,
            emulate_motion: false,
            area_detect: String::new(),
            text_event: String::new(),
            picture_output: true,
            picture_output_motion: false,
            picture_type: "jpeg".to_string(),
            picture_quality: 75,
            picture_filename: "%v-%Y%m%d%H%M%S-%q".to_string(),
            movie_output: true,
            movie_filename: "%v-%Y%m%d%H%M%S".to_string(),
            movie_extpipe: String::new(),
            timelapse_interval: 0,
            timelapse_mode: "daily".to_string(),
            timelapse_filename: "%Y%m%d-timelapse".to_string(),
            snapshot_interval: 0,
            snapshot_filename: "%v-%Y%m%d%H%M%S-snapshot".to_string(),
            on_event_start: String::new(),
            on_event_end: String::new(),
            on_motion_detected: String::new(),
            on_area_detected: String::new(),
            on_picture_save: String::new(),
            on_movie_start: String::new(),
            on_movie_end: String::new(),
            on_camera_lost: String::new(),
            on_camera_found: String::new(),
            watchdog_tmo: 30,
            watchdog_kill: 10,
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<HubConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let cfg: HubConfig = serde_yaml2::from_str(&content)
            .with_context(|| format!("could not parse {}", path.display()))?;
        Ok(cfg)
    }
}

impl CameraConfig {
    pub fn detection_config(&self) -> DetectionConfig {
        DetectionConfig {
            width: self.detect_width(),
            height: self.detect_height(),
            noise_level: self.noise_level,
            noise_tune: self.noise_tune,
            threshold: self.threshold,
            threshold_tune: self.threshold_tune,
            threshold_minimum: self.threshold_minimum,
            despeckle_filter: self.despeckle_filter.clone(),
            label_min_pixels: self.label_min_pixels,
            lightswitch_percent: self.lightswitch_percent,
            lightswitch_frames: self.lightswitch_frames,
            smart_mask_speed: self.smart_mask_speed,
            framerate: self.framerate,
        }
    }

    pub fn event_config(&self) -> EventConfig {
        EventConfig {
            minimum_motion_frames: self.minimum_motion_frames,
            event_gap: Duration::from_secs(self.event_gap),
            pre_capture: self.pre_capture,
            post_capture: self.post_capture,
            emulate_motion: self.emulate_motion,
            area_detect: self
                .area_detect
                .chars()
                .filter_map(|c| c.to_digit(10))
                .filter(|&d| (1..=9).contains(&d))
                .map(|d| d as u8)
                .collect(),
        }
    }

    pub fn flip(&self) -> FlipAxis {
        match self.flip_axis.as_str() {
            "horizontal" => FlipAxis::Horizontal,
            "vertical" => FlipAxis::Vertical,
            _ => FlipAxis::None,
        }
    }

    /// Frame dimensions after rotation.
    pub fn detect_width(&self) -> usize {
        if matches!(self.rotate.rem_euclid(360), 90 | 270) {
            self.height
        } else {
            self.width
        }
    }

    pub fn detect_height(&self) -> usize {
        if matches!(self.rotate.rem_euclid(360), 90 | 270) {
            self.width
        } else {
            self.height
        }
    }

    /// The frame interval the capture loop paces itself to.
    pub fn frame_interval(&self) -> Duration {
        let by_rate = Duration::from_secs_f64(1.0 / f64::from(self.framerate.max(1)));
        let floor = Duration::from_secs_f64(self.minimum_frame_time.max(0.0));
        by_rate.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_gets_defaults() {
        let cfg: HubConfig = serde_yaml2::from_str(
            "cameras:\n  - name: porch\n    camera_id: 3\n    threshold: 2000\n",
        )
        .unwrap();
        assert_eq!(cfg.cameras.len(), 1);
        let c = &cfg.cameras[0];
        assert_eq!(c.name, "porch");
        assert_eq!(c.camera_id, 3);
        assert_eq!(c.threshold, 2000);
        assert_eq!(c.framerate, 15);
        assert!(c.movie_output);
    }

    #[test]
    fn area_detect_parses_digits_only() {
        let c = CameraConfig {
            area_detect: "159x0".to_string(),
            ..CameraConfig::default()
        };
        assert_eq!(c.event_config().area_detect, vec![1, 5, 9]);
    }

    #[test]
    fn rotation_swaps_detect_dimensions() {
        let c = CameraConfig {
            rotate: 270,
            width: 640,
            height: 480,
            ..CameraConfig::default()
        };
        assert_eq!(c.detect_width(), 480);
        assert_eq!(c.detect_height(), 640);
    }

    #[test]
    fn frame_interval_honours_minimum_frame_time() {
        let c = CameraConfig {
            framerate: 30,
            minimum_frame_time: 0.5,
            ..CameraConfig::default()
        };
        assert_eq!(c.frame_interval(), Duration::from_millis(500));
    }
}
