// THEORY:
// The `AdaptiveBgTracker` follows exactly one animal per ROI against a background
// that keeps learning. It is the reference pipeline; the other variants are
// variations on its steps.
//
// Per frame:
// 1.  Pre-process the crop. On the first frame there is no background yet: the
//     frame seeds it and no position is reported.
// 2.  Subtract the background, threshold, and check the foreground share. Nothing
//     or too much foreground raises the learning rate and reports no position.
// 3.  Trace outer contours and keep those of a minimum area.
// 4.  **Choosing**: one contour is taken as is. With several, the appearance model
//     arbitrates once it has seen enough detections; before that the frame has no
//     position. Choosing among several marks the frame *ambiguous*.
// 5.  A candidate that looks too unlike the learned animal, or whose rectangle is
//     degenerate, is rejected.
// 6.  Emit x, y, w, h, phi and the log-scaled displacement from the previous
//     detection.
// 7.  Feed the background: an ambiguous frame speeds learning up and blends the
//     whole frame; a clean frame slows learning down and keeps the animal's pixels
//     out of the average.
//
// Any no-position outcome still blends the frame into the background, unmasked,
// so a persistent change in the scene is eventually absorbed.

use crate::core_modules::background::{BackgroundModel, LearningRateConfig};
use crate::core_modules::contour::Contour;
use crate::core_modules::data_point::DataPoint;
use crate::core_modules::object_model::ObjectModel;
use crate::core_modules::preprocess::{PreprocessConfig, preprocess};
use crate::core_modules::roi::Roi;
use crate::core_modules::segmentation::{CONTOUR_TOLERANCE, segmentation};
use crate::core_modules::variables::Variable;
use crate::error::{NoPositionReason, Result, no_position};
use crate::trackers::{History, ThresholdConfig, Tracker, TrackerKind};
use image::{GrayImage, Luma};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdaptiveBgConfig {
    /// Expected animal size as a share of the ROI's longest axis.
    pub object_expected_size: f64,
    /// The foreground share may reach `(max_area_factor * object_expected_size)^2`.
    pub max_area_factor: f64,
    pub darker_foreground: bool,
    pub adaptive_lighting: bool,
    pub adaptive_threshold: bool,
    pub fg_threshold: u8,
    pub min_fg_threshold: u8,
    pub max_fg_threshold: u8,
    pub min_contour_area: f64,
    /// Candidates scoring above this appearance distance are rejected.
    pub max_m_log_lik: f64,
    #[serde(flatten)]
    pub learning_rate: LearningRateConfig,
}

impl Default for AdaptiveBgConfig {
    fn default() -> Self {
        Self {
            object_expected_size: 0.05,
            max_area_factor: 5.0,
            darker_foreground: true,
            adaptive_lighting: false,
            adaptive_threshold: false,
            fg_threshold: 20,
            min_fg_threshold: 10,
            max_fg_threshold: 50,
            min_contour_area: 3.0,
            max_m_log_lik: 5.5,
            learning_rate: LearningRateConfig::default(),
        }
    }
}

impl AdaptiveBgConfig {
    pub fn max_area_ratio(&self) -> f64 {
        (self.max_area_factor * self.object_expected_size).powi(2)
    }

    fn threshold(&self) -> ThresholdConfig {
        ThresholdConfig {
            adaptive: self.adaptive_threshold,
            fixed: self.fg_threshold,
            min: self.min_fg_threshold,
            max: self.max_fg_threshold,
        }
    }

    fn preprocess(&self) -> PreprocessConfig {
        PreprocessConfig {
            darker_foreground: self.darker_foreground,
            adaptive_lighting: self.adaptive_lighting,
        }
    }
}

pub struct AdaptiveBgTracker {
    roi: Arc<Roi>,
    config: AdaptiveBgConfig,
    history: History,
    bg_model: BackgroundModel,
    object_model: ObjectModel,
    previous_position: Option<(f64, f64)>,
}

impl AdaptiveBgTracker {
    pub fn new(roi: Arc<Roi>, config: AdaptiveBgConfig) -> Self {
        Self {
            roi,
            bg_model: BackgroundModel::new(config.learning_rate),
            config,
            history: History::default(),
            object_model: ObjectModel::default(),
            previous_position: None,
        }
    }

    pub fn config(&self) -> &AdaptiveBgConfig {
        &self.config
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.bg_model
    }

    fn track_grey(&mut self, grey: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>> {
        let Some(bg) = self.bg_model.bg_img() else {
            return no_position(NoPositionReason::Seeding);
        };

        // --- 1. Foreground ---
        let mut fg = segmentation::subtract(grey, &bg);
        self.config.threshold().apply(&mut fg);
        if let Err(e) = segmentation::check_health(&fg, mask, self.config.max_area_ratio()) {
            self.bg_model.increase_learning_rate();
            return Err(e);
        }

        // --- 2. Candidates ---
        let contours = segmentation::external_contours(&fg, CONTOUR_TOLERANCE);
        if contours.is_empty() {
            self.bg_model.increase_learning_rate();
            return no_position(NoPositionReason::NoContours);
        }
        let mut valid: Vec<Contour> = contours
            .into_iter()
            .filter(|c| c.area() >= self.config.min_contour_area && c.perimeter() > 0.0)
            .collect();
        if valid.is_empty() {
            self.bg_model.increase_learning_rate();
            return no_position(NoPositionReason::NoValidContours);
        }

        // --- 3. Choice ---
        let ambiguous = valid.len() > 1;
        if ambiguous && !self.object_model.is_ready() {
            return no_position(NoPositionReason::Ambiguous);
        }
        let scored: Vec<f64> = valid
            .iter()
            .map(|c| {
                let features = ObjectModel::compute_features(grey, c);
                self.object_model.distance(&features, t)
            })
            .collect();
        let (best, distance) = scored
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::INFINITY), |(bi, bd), (i, d)| if d < bd { (i, d) } else { (bi, bd) });
        let chosen = valid.swap_remove(best);

        if distance > self.config.max_m_log_lik {
            self.bg_model.increase_learning_rate();
            return no_position(NoPositionReason::Unlikely);
        }

        let rect = chosen.min_area_rect().normalized();
        if rect.exceeds_frame(grey.width(), grey.height()) {
            return no_position(NoPositionReason::Degenerate);
        }

        // --- 4. Model Updates ---
        if ambiguous {
            self.bg_model.increase_learning_rate();
            self.bg_model.update(grey, t, None)?;
        } else {
            for (p, m) in fg.pixels_mut().zip(mask.pixels()) {
                if m[0] == 0 {
                    *p = Luma([0]);
                }
            }
            self.bg_model.decrease_learning_rate();
            self.bg_model.update(grey, t, Some(&fg))?;
        }
        self.object_model.update(grey, &chosen, t);

        // --- 5. Output ---
        let xy_dist = self
            .previous_position
            .map(|(px, py)| {
                let d = (rect.center.0 - px).hypot(rect.center.1 - py);
                ((d + 1.0).log10() * 1000.0).round() as i64
            })
            .unwrap_or(0);
        self.previous_position = Some(rect.center);

        let mut point = DataPoint::new(rect.to_variables());
        point.append(Variable::xy_distance(xy_dist));
        Ok(vec![point])
    }
}

impl Tracker for AdaptiveBgTracker {
    fn find_position(&mut self, sub_frame: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>> {
        let grey = preprocess(sub_frame, mask, &self.config.preprocess())?;
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
        TrackerKind::AdaptiveBg
    }

    fn history(&self) -> &History {
        &self.history
    }

    fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }
}
