// THEORY:
// The `MultiFlyTracker` reports every animal it can see in a ROI, without
// identities. Frames are independent detections; nothing links a record to the
// previous frame's records.
//
// Per frame:
// 1.  Pre-process with adaptive lighting on, so the pipeline tolerates scenes
//     that are much brighter or darker than usual.
// 2.  Subtract the background and threshold adaptively (30% of the mean
//     difference, clamped).
// 3.  **Morphological Filter**: opening, closing, and erasure of connected
//     components outside `[min_area, 3 * max_area]` of the expected animal size.
//     This removes compression speckle and large lighting artefacts before the
//     health check looks at the frame.
// 4.  **Health**: the filtered share of foreground must be positive and below
//     what `2 * max_area` animals would cover in half the ROI.
// 5.  **Validity**: each outer contour goes through the `ForegroundModel`, which
//     learns the usual blob area and rejects outliers. Degenerate rectangles are
//     skipped individually.
// 6.  When more than `max_n` animals survive, the largest `w * h` win.
// 7.  The background is updated with the animals excluded: the filtered
//     foreground plus an ellipse at 1.5x each detection's rectangle.
//
// Every failure in steps 3 to 6 raises the learning rate so that a scene change
// is absorbed quickly.

use crate::core_modules::background::{BackgroundModel, LearningRateConfig};
use crate::core_modules::data_point::DataPoint;
use crate::core_modules::preprocess::{PreprocessConfig, preprocess};
use crate::core_modules::roi::Roi;
use crate::core_modules::segmentation::{
    CONTOUR_TOLERANCE, ForegroundModel, ForegroundModelConfig, segmentation,
};
use crate::core_modules::variables::VariableKind;
use crate::error::{NoPositionReason, Result, no_position};
use crate::trackers::{History, ThresholdConfig, Tracker, TrackerKind};
use image::{GrayImage, Luma};
use log::debug;
use serde::Deserialize;
use std::sync::Arc;

/// Ellipse scale used when masking detections out of the background.
pub(crate) const EXCLUSION_SCALE: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MultiFlyConfig {
    /// Most records reported per frame.
    #[serde(alias = "maxN")]
    pub max_n: usize,
    pub darker_foreground: bool,
    pub adaptive_lighting: bool,
    pub adaptive_threshold: bool,
    pub fg_threshold: u8,
    pub min_fg_threshold: u8,
    pub max_fg_threshold: u8,
    #[serde(alias = "fg_data")]
    pub foreground: ForegroundModelConfig,
    #[serde(flatten)]
    pub learning_rate: LearningRateConfig,
}

impl Default for MultiFlyConfig {
    fn default() -> Self {
        Self {
            max_n: 50,
            darker_foreground: true,
            adaptive_lighting: true,
            adaptive_threshold: true,
            fg_threshold: 20,
            min_fg_threshold: 10,
            max_fg_threshold: 50,
            foreground: ForegroundModelConfig::default(),
            learning_rate: LearningRateConfig::default(),
        }
    }
}

impl MultiFlyConfig {
    /// Foreground share of `2 * max_area` animals spread over half the ROI.
    pub fn max_area_ratio(&self, roi: &Roi) -> f64 {
        let (_, _, w, h) = roi.rectangle();
        let half_area = (w as f64 * h as f64 * 0.5).max(1.0);
        self.foreground.normal_limits.1 * 2.0 / half_area
    }

    pub(crate) fn threshold(&self) -> ThresholdConfig {
        ThresholdConfig {
            adaptive: self.adaptive_threshold,
            fixed: self.fg_threshold,
            min: self.min_fg_threshold,
            max: self.max_fg_threshold,
        }
    }

    pub(crate) fn preprocess(&self) -> PreprocessConfig {
        PreprocessConfig {
            darker_foreground: self.darker_foreground,
            adaptive_lighting: self.adaptive_lighting,
        }
    }
}

/// The outcome of one detection pass.
pub(crate) struct Detection {
    pub points: Vec<DataPoint>,
    /// Pixels to keep out of a background update.
    pub exclusion: GrayImage,
}

pub struct MultiFlyTracker {
    roi: Arc<Roi>,
    config: MultiFlyConfig,
    history: History,
    bg_model: BackgroundModel,
    fg_model: ForegroundModel,
}

impl MultiFlyTracker {
    pub fn new(roi: Arc<Roi>, config: MultiFlyConfig) -> Self {
        Self {
            roi,
            bg_model: BackgroundModel::new(config.learning_rate),
            fg_model: ForegroundModel::new(config.foreground),
            config,
            history: History::default(),
        }
    }

    pub fn config(&self) -> &MultiFlyConfig {
        &self.config
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.bg_model
    }

    pub(crate) fn preprocess(&self, sub_frame: &GrayImage, mask: &GrayImage) -> Result<GrayImage> {
        preprocess(sub_frame, mask, &self.config.preprocess())
    }

    /// Finds every animal in `grey` against `bg`. Touches no background state.
    pub(crate) fn detect(&mut self, grey: &GrayImage, bg: &GrayImage, mask: &GrayImage) -> Result<Detection> {
        let (min_area, max_area) = self.config.foreground.normal_limits;

        // --- 1. Foreground ---
        let mut fg = segmentation::subtract(grey, bg);
        let cut = self.config.threshold().apply(&mut fg);
        let mut filtered =
            segmentation::morphological_filter(&segmentation::binarize(&fg), min_area, 3.0 * max_area);
        segmentation::check_health(&filtered, mask, self.config.max_area_ratio(&self.roi))?;

        // --- 2. Candidates ---
        let contours = segmentation::external_contours(&filtered, CONTOUR_TOLERANCE);
        if contours.is_empty() {
            debug!("No contours at threshold {cut}");
            return no_position(NoPositionReason::NoContours);
        }

        // --- 3. Validation ---
        let (w, h) = grey.dimensions();
        let mut points = Vec::new();
        for contour in &contours {
            if contour.perimeter() <= 0.0 || !self.fg_model.is_valid(contour.area()) {
                continue;
            }
            let rect = contour.min_area_rect().normalized();
            if rect.exceeds_frame(w, h) {
                continue;
            }
            rect.stamp_ellipse(&mut filtered, EXCLUSION_SCALE, 255);
            points.push(DataPoint::new(rect.to_variables()));
        }
        if points.is_empty() {
            debug!("None of {} contours passed validation", contours.len());
            return no_position(NoPositionReason::NoValidContours);
        }

        // --- 4. Cap ---
        if points.len() > self.config.max_n {
            let found = points.len();
            let area = |p: &DataPoint| {
                p.value_of(VariableKind::Width).unwrap_or(0) * p.value_of(VariableKind::Height).unwrap_or(0)
            };
            points.sort_by_key(|p| std::cmp::Reverse(area(p)));
            points.truncate(self.config.max_n);
            debug!("Kept the {} largest of {found} detections", points.len());
        }

        for (p, m) in filtered.pixels_mut().zip(mask.pixels()) {
            if m[0] == 0 {
                *p = Luma([0]);
            }
        }
        Ok(Detection {
            points,
            exclusion: filtered,
        })
    }

    fn track_grey(&mut self, grey: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>> {
        let Some(bg) = self.bg_model.bg_img() else {
            return no_position(NoPositionReason::Seeding);
        };
        let detection = match self.detect(grey, &bg, mask) {
            Ok(d) => d,
            Err(e) => {
                if e.is_no_position() {
                    self.bg_model.increase_learning_rate();
                }
                return Err(e);
            }
        };

        self.bg_model.decrease_learning_rate();
        self.bg_model.update(grey, t, Some(&detection.exclusion))?;
        Ok(detection.points)
    }
}

impl Tracker for MultiFlyTracker {
    fn find_position(&mut self, sub_frame: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>> {
        let grey = self.preprocess(sub_frame, mask)?;
        match self.track_grey(&grey, mask, t) {
            Err(e) if e.is_no_position() => {
                self.bg_model.update(&grey, t, None)?;
                Err(e)
            }
            other => other,
        }
    }

    fn roi(&self) -> &Roi {
        &self.roi
    }

    fn kind(&self) -> TrackerKind {
        TrackerKind::MultiFly
    }

    fn history(&self) -> &History {
        &self.history
    }

    fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const SIZE: u32 = 100;

    fn arena(flies: &[(u32, u32, u32, u32)]) -> GrayImage {
        GrayImage::from_fn(SIZE, SIZE, |x, y| {
            let inside = flies
                .iter()
                .any(|&(fx, fy, fw, fh)| x >= fx && x < fx + fw && y >= fy && y < fy + fh);
            Luma([if inside { 20 } else { 140 }])
        })
    }

    fn mask() -> GrayImage {
        GrayImage::from_pixel(SIZE, SIZE, Luma([255]))
    }

    fn config() -> MultiFlyConfig {
        MultiFlyConfig {
            foreground: ForegroundModelConfig {
                normal_limits: (10.0, 400.0),
                ..ForegroundModelConfig::default()
            },
            ..MultiFlyConfig::default()
        }
    }

    fn tracker(config: MultiFlyConfig) -> MultiFlyTracker {
        MultiFlyTracker::new(Arc::new(Roi::from_rect(0, 0, 0, SIZE, SIZE)), config)
    }

    #[test]
    fn reports_each_animal() {
        let mut tracker = tracker(config());
        assert!(tracker.find_position(&arena(&[]), &mask(), 0).is_err());

        let flies = [(10, 10, 10, 5), (60, 20, 10, 5), (30, 70, 5, 10)];
        let points = tracker.find_position(&arena(&flies), &mask(), 40).unwrap();

        assert_eq!(points.len(), 3);
        for p in &points {
            assert!(p.value_of(VariableKind::Width).unwrap() >= p.value_of(VariableKind::Height).unwrap());
            assert!((0..180).contains(&p.value_of(VariableKind::Phi).unwrap()));
            assert_eq!(p.value_of(VariableKind::Id), None);
        }
        let mut xs: Vec<i64> = points.iter().map(|p| p.value_of(VariableKind::X).unwrap()).collect();
        xs.sort();
        assert!((xs[0] - 15).abs() <= 1);
        assert!((xs[1] - 32).abs() <= 1);
        assert!((xs[2] - 65).abs() <= 1);
    }

    #[test]
    fn caps_to_the_largest_detections() {
        let mut tracker = tracker(MultiFlyConfig {
            max_n: 1,
            ..config()
        });
        tracker.find_position(&arena(&[]), &mask(), 0).unwrap_err();

        let flies = [(10, 10, 8, 4), (60, 60, 14, 6)];
        let points = tracker.find_position(&arena(&flies), &mask(), 40).unwrap();

        assert_eq!(points.len(), 1);
        assert!((points[0].value_of(VariableKind::X).unwrap() - 67).abs() <= 1);
    }

    #[test]
    fn detections_are_kept_out_of_the_background() {
        let mut tracker = tracker(config());
        tracker.find_position(&arena(&[]), &mask(), 0).unwrap_err();
        let before = tracker.background().bg_img().unwrap();

        tracker.find_position(&arena(&[(40, 40, 10, 5)]), &mask(), 40).unwrap();

        let after = tracker.background().bg_img().unwrap();
        assert_eq!(after.get_pixel(45, 42), before.get_pixel(45, 42));
    }

    #[test]
    fn blobs_outside_the_area_limits_are_ignored() {
        let mut tracker = tracker(MultiFlyConfig {
            foreground: ForegroundModelConfig {
                normal_limits: (200.0, 400.0),
                ..ForegroundModelConfig::default()
            },
            ..MultiFlyConfig::default()
        });
        tracker.find_position(&arena(&[]), &mask(), 0).unwrap_err();
        let before = tracker.background().learning_rate();

        let err = tracker.find_position(&arena(&[(10, 10, 3, 3)]), &mask(), 40).unwrap_err();

        assert!(err.is_no_position());
        assert!(tracker.background().learning_rate() >= before);
    }

    #[test]
    fn options_accept_the_legacy_names() {
        let config: MultiFlyConfig = serde_json::from_value(serde_json::json!({
            "maxN": 7,
            "fg_data": { "normal_limits": [20, 300] },
            "adaptive_threshold": false,
        }))
        .unwrap();
        assert_eq!(config.max_n, 7);
        assert_eq!(config.foreground.normal_limits, (20.0, 300.0));
        assert_eq!(config.foreground.sample_size, 400);
        assert!(!config.adaptive_threshold);
        assert!(config.adaptive_lighting);
    }

    #[test]
    fn bad_option_types_fail() {
        let err = serde_json::from_value::<MultiFlyConfig>(serde_json::json!({ "max_n": "many" })).unwrap_err();
        assert!(matches!(Error::from(err), Error::Config(_)));
    }
}
