// THEORY:
// The `IdentityTracker` follows a known number of animals in one ROI and keeps a
// stable integer identity on each of them. Segmentation follows the single-object
// pipeline; all identity logic lives in `IdentityState`.
//
// Per frame:
// 1.  Pre-process, subtract, threshold, check the foreground share, trace outer
//     contours. Health failures raise the learning rate.
// 2.  Keep contours that are non-degenerate and, when `fg_area_limits` is set,
//     whose area lies inside it. No valid contour at all is the only per-frame
//     failure once identities exist; a single lost animal is not.
// 3.  More contours than animals means the segmentation is confused: the frame is
//     *ambiguous* and the background learns faster, unmasked.
// 4.  Feed the contours to `IdentityState`. During bootstrap nothing is reported,
//     and the background learns around whatever was segmented.
// 5.  Report one record per label and update the background with every labelled
//     animal masked out (an ellipse at 1.5x its rectangle, plus the raw
//     foreground).

use crate::core_modules::background::{BackgroundModel, LearningRateConfig};
use crate::core_modules::contour::Contour;
use crate::core_modules::data_point::DataPoint;
use crate::core_modules::identity::{IdentityConfig, IdentityState};
use crate::core_modules::preprocess::{PreprocessConfig, preprocess};
use crate::core_modules::roi::Roi;
use crate::core_modules::segmentation::{CONTOUR_TOLERANCE, segmentation};
use crate::error::{Error, NoPositionReason, Result, no_position};
use crate::trackers::multi_fly::EXCLUSION_SCALE;
use crate::trackers::{History, ThresholdConfig, Tracker, TrackerKind};
use image::{GrayImage, Luma};
use log::debug;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentityTrackerConfig {
    #[serde(alias = "n_flies")]
    pub n_objects: usize,
    pub settle_frames: u32,
    pub object_expected_size: f64,
    pub max_area_factor: f64,
    pub darker_foreground: bool,
    pub adaptive_lighting: bool,
    pub adaptive_threshold: bool,
    pub fg_threshold: u8,
    pub min_fg_threshold: u8,
    pub max_fg_threshold: u8,
    pub min_contour_area: f64,
    /// Optional hard `(min, max)` contour area band.
    pub fg_area_limits: Option<(f64, f64)>,
    #[serde(flatten)]
    pub learning_rate: LearningRateConfig,
}

impl Default for IdentityTrackerConfig {
    fn default() -> Self {
        let identity = IdentityConfig::default();
        Self {
            n_objects: identity.n_objects,
            settle_frames: identity.settle_frames,
            object_expected_size: 0.05,
            max_area_factor: 5.0,
            darker_foreground: true,
            adaptive_lighting: false,
            adaptive_threshold: false,
            fg_threshold: 20,
            min_fg_threshold: 10,
            max_fg_threshold: 50,
            min_contour_area: 3.0,
            fg_area_limits: None,
            learning_rate: LearningRateConfig::default(),
        }
    }
}

impl IdentityTrackerConfig {
    pub fn max_area_ratio(&self) -> f64 {
        (self.max_area_factor * self.object_expected_size).powi(2)
    }

    fn identity(&self) -> IdentityConfig {
        IdentityConfig {
            n_objects: self.n_objects,
            settle_frames: self.settle_frames,
        }
    }

    fn is_valid(&self, contour: &Contour) -> bool {
        let area = contour.area();
        if contour.perimeter() <= 0.0 || area < self.min_contour_area {
            return false;
        }
        self.fg_area_limits
            .is_none_or(|(min, max)| area >= min && area <= max)
    }
}

pub struct IdentityTracker {
    roi: Arc<Roi>,
    config: IdentityTrackerConfig,
    history: History,
    bg_model: BackgroundModel,
    identities: IdentityState,
}

impl IdentityTracker {
    pub fn new(roi: Arc<Roi>, config: IdentityTrackerConfig) -> Self {
        Self {
            roi,
            bg_model: BackgroundModel::new(config.learning_rate),
            identities: IdentityState::new(config.identity()),
            config,
            history: History::default(),
        }
    }

    pub fn config(&self) -> &IdentityTrackerConfig {
        &self.config
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.bg_model
    }

    pub fn identities(&self) -> &IdentityState {
        &self.identities
    }

    fn track_grey(&mut self, grey: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>> {
        let Some(bg) = self.bg_model.bg_img() else {
            return no_position(NoPositionReason::Seeding);
        };
        let (w, h) = grey.dimensions();

        // --- 1. Foreground ---
        let mut fg = segmentation::subtract(grey, &bg);
        ThresholdConfig {
            adaptive: self.config.adaptive_threshold,
            fixed: self.config.fg_threshold,
            min: self.config.min_fg_threshold,
            max: self.config.max_fg_threshold,
        }
        .apply(&mut fg);
        if let Err(e) = segmentation::check_health(&fg, mask, self.config.max_area_ratio()) {
            self.bg_model.increase_learning_rate();
            return Err(e);
        }
        let fg = segmentation::binarize(&fg);

        // --- 2. Candidates ---
        let contours = segmentation::external_contours(&fg, CONTOUR_TOLERANCE);
        if contours.is_empty() {
            self.bg_model.increase_learning_rate();
            return no_position(NoPositionReason::NoContours);
        }
        let valid: Vec<Contour> = contours.into_iter().filter(|c| self.config.is_valid(c)).collect();
        if valid.is_empty() {
            self.bg_model.increase_learning_rate();
            return no_position(NoPositionReason::NoValidContours);
        }
        let ambiguous = valid.len() > self.identities.n_objects();
        if ambiguous {
            debug!(
                "ROI {}: {} contours for {} animals",
                self.roi.idx(),
                valid.len(),
                self.identities.n_objects()
            );
        }

        // --- 3. Identities ---
        if let Err(e) = self.identities.update(valid, w, h) {
            if ambiguous {
                self.bg_model.increase_learning_rate();
                self.bg_model.update(grey, t, None)?;
            } else {
                self.bg_model.update(grey, t, Some(&fg))?;
            }
            return Err(e);
        }

        let points = self.identities.positions(w, h);
        if points.is_empty() {
            return no_position(NoPositionReason::Degenerate);
        }

        // --- 4. Background ---
        if ambiguous {
            self.bg_model.increase_learning_rate();
            self.bg_model.update(grey, t, None)?;
        } else {
            let mut exclusion = self.identities.exclusion_mask(w, h, EXCLUSION_SCALE);
            for ((e, f), m) in exclusion.pixels_mut().zip(fg.pixels()).zip(mask.pixels()) {
                *e = Luma([if (e[0] > 0 || f[0] > 0) && m[0] > 0 { 255 } else { 0 }]);
            }
            self.bg_model.decrease_learning_rate();
            self.bg_model.update(grey, t, Some(&exclusion))?;
        }
        Ok(points)
    }
}

impl Tracker for IdentityTracker {
    fn find_position(&mut self, sub_frame: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>> {
        let grey = preprocess(
            sub_frame,
            mask,
            &PreprocessConfig {
                darker_foreground: self.config.darker_foreground,
                adaptive_lighting: self.config.adaptive_lighting,
            },
        )?;
        match self.track_grey(&grey, mask, t) {
            // Bootstrapping frames already fed the background.
            Err(e @ Error::NoPosition(NoPositionReason::Bootstrapping)) => Err(e),
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
        TrackerKind::MultiFlyIds
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
    use crate::core_modules::variables::VariableKind;

    const SIZE: u32 = 100;

    fn arena(flies: &[(u32, u32)]) -> GrayImage {
        GrayImage::from_fn(SIZE, SIZE, |x, y| {
            let inside = flies.iter().any(|&(cx, cy)| x.abs_diff(cx) <= 3 && y.abs_diff(cy) <= 2);
            Luma([if inside { 20 } else { 140 }])
        })
    }

    fn mask() -> GrayImage {
        GrayImage::from_pixel(SIZE, SIZE, Luma([255]))
    }

    fn tracker(n_objects: usize, settle_frames: u32) -> IdentityTracker {
        IdentityTracker::new(
            Arc::new(Roi::from_rect(0, 0, 0, SIZE, SIZE)),
            IdentityTrackerConfig {
                n_objects,
                settle_frames,
                ..IdentityTrackerConfig::default()
            },
        )
    }

    fn id_near(points: &[DataPoint], x: i64, y: i64) -> Option<i64> {
        points
            .iter()
            .find(|p| {
                (p.value_of(VariableKind::X).unwrap() - x).abs() <= 3
                    && (p.value_of(VariableKind::Y).unwrap() - y).abs() <= 3
            })
            .and_then(|p| p.value_of(VariableKind::Id))
    }

    #[test]
    fn identities_lock_after_the_settle_streak() {
        let mut tracker = tracker(2, 2);
        let flies = [(20, 20), (70, 70)];
        tracker.find_position(&arena(&[]), &mask(), 0).unwrap_err();

        for t in 1..=2 {
            let err = tracker.find_position(&arena(&flies), &mask(), t * 40).unwrap_err();
            assert!(matches!(err, Error::NoPosition(NoPositionReason::Bootstrapping)));
            assert!(!tracker.identities().is_locked());
        }

        let points = tracker.find_position(&arena(&flies), &mask(), 120).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(id_near(&points, 20, 20), Some(1));
        assert_eq!(id_near(&points, 70, 70), Some(2));
    }

    #[test]
    fn labels_follow_their_animals() {
        let mut tracker = tracker(2, 0);
        tracker.find_position(&arena(&[]), &mask(), 0).unwrap_err();
        tracker.find_position(&arena(&[(20, 20), (70, 70)]), &mask(), 40).unwrap();

        let points = tracker.find_position(&arena(&[(72, 68), (22, 21)]), &mask(), 80).unwrap();

        assert_eq!(id_near(&points, 22, 21), Some(1));
        assert_eq!(id_near(&points, 72, 68), Some(2));
    }

    #[test]
    fn a_missing_animal_keeps_its_last_position() {
        let mut tracker = tracker(2, 0);
        tracker.find_position(&arena(&[]), &mask(), 0).unwrap_err();
        tracker.find_position(&arena(&[(20, 20), (70, 70)]), &mask(), 40).unwrap();

        let points = tracker.find_position(&arena(&[(21, 20)]), &mask(), 80).unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(id_near(&points, 70, 70), Some(2));
    }

    #[test]
    fn no_foreground_is_a_no_position_frame() {
        let mut tracker = tracker(2, 0);
        tracker.find_position(&arena(&[]), &mask(), 0).unwrap_err();
        let err = tracker.find_position(&arena(&[]), &mask(), 40).unwrap_err();
        assert!(matches!(err, Error::NoPosition(NoPositionReason::NoForeground)));
    }

    /// A 100x12 ROI holding a 30 px bar and, optionally, a small fly.
    fn long_bar(with_fly: bool) -> GrayImage {
        GrayImage::from_fn(100, 12, |x, y| {
            let bar = (5..8).contains(&y) && (35..65).contains(&x);
            let fly = with_fly && (5..8).contains(&y) && (80..85).contains(&x);
            Luma([if bar || fly { 20 } else { 140 }])
        })
    }

    fn strip_tracker(n_objects: usize) -> IdentityTracker {
        IdentityTracker::new(
            Arc::new(Roi::from_rect(0, 0, 0, 100, 12)),
            IdentityTrackerConfig {
                n_objects,
                settle_frames: 0,
                object_expected_size: 0.2,
                ..IdentityTrackerConfig::default()
            },
        )
    }

    #[test]
    fn a_degenerate_label_does_not_hide_the_others() {
        let strip_mask = GrayImage::from_pixel(100, 12, Luma([255]));
        let mut tracker = strip_tracker(2);
        let empty = GrayImage::from_pixel(100, 12, Luma([140]));
        tracker.find_position(&empty, &strip_mask, 0).unwrap_err();

        let points = tracker.find_position(&long_bar(true), &strip_mask, 40).unwrap();

        assert_eq!(points.len(), 1);
        assert!(points[0].value_of(VariableKind::Width).unwrap() < 24);
        assert!((points[0].value_of(VariableKind::X).unwrap() - 82).abs() <= 2);
        assert_eq!(tracker.identities().identities().len(), 2);
    }

    #[test]
    fn only_degenerate_labels_is_a_no_position_frame() {
        let strip_mask = GrayImage::from_pixel(100, 12, Luma([255]));
        let mut tracker = strip_tracker(1);
        let empty = GrayImage::from_pixel(100, 12, Luma([140]));
        tracker.find_position(&empty, &strip_mask, 0).unwrap_err();

        let err = tracker.find_position(&long_bar(false), &strip_mask, 40).unwrap_err();

        assert!(matches!(err, Error::NoPosition(NoPositionReason::Degenerate)));
        assert!(tracker.identities().is_locked());
    }

    #[test]
    fn area_limits_filter_contours() {
        let config = IdentityTrackerConfig {
            fg_area_limits: Some((500.0, 1000.0)),
            ..IdentityTrackerConfig::default()
        };
        let square = Contour::new(vec![
            imageproc::point::Point::new(0, 0),
            imageproc::point::Point::new(5, 0),
            imageproc::point::Point::new(5, 5),
            imageproc::point::Point::new(0, 5),
        ]);
        assert!(!config.is_valid(&square));
        assert!(IdentityTrackerConfig::default().is_valid(&square));
    }

    #[test]
    fn options_accept_the_legacy_names() {
        let config: IdentityTrackerConfig =
            serde_json::from_value(serde_json::json!({ "n_flies": 3, "fg_area_limits": [10, 90] })).unwrap();
        assert_eq!(config.n_objects, 3);
        assert_eq!(config.fg_area_limits, Some((10.0, 90.0)));
        assert_eq!(config.settle_frames, 5);
    }
}
