// THEORY:
// A tracker turns a stream of timestamped frames into positions for one ROI.
// Every variant shares the same outer contract and differs only in how it finds
// animals inside a pre-cropped sub-frame.
//
// Key architectural principles:
// 1.  **One Seam**: `Tracker::find_position` is the only thing a variant has to
//     implement. It returns a non-empty list of records, or `Error::NoPosition`
//     when nothing could be located with confidence.
// 2.  **Shared Lifecycle**: the provided `Tracker::track` method does the work that
//     is identical for every variant: crop through the ROI, refuse timestamps that
//     do not increase, tag records with `is_inferred`, swallow no-position frames by
//     re-emitting the last known positions for a while, and keep a bounded history.
// 3.  **Configuration**: each variant has its own immutable config struct, built
//     per instance from a JSON mapping. Missing keys take defaults, unknown keys are
//     ignored, ill-typed keys fail at construction.
// 4.  **Construction by Name**: `TrackerKind` names every variant, and
//     `build_tracker` is the factory the orchestration layer calls.
//
// Scratch buffers live inside each tracker instance and are never shared, so a
// tracker is `Send` but is used by one worker at a time.

pub mod adaptive_bg;
pub mod multi_fly;
pub mod multi_fly_ids;
pub mod precomputed_bg;

use crate::core_modules::data_point::DataPoint;
use crate::core_modules::roi::Roi;
use crate::core_modules::segmentation::segmentation;
use crate::core_modules::variables::Variable;
use crate::error::{Error, Result};
use image::GrayImage;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};

pub use adaptive_bg::{AdaptiveBgConfig, AdaptiveBgTracker};
pub use multi_fly::{MultiFlyConfig, MultiFlyTracker};
pub use multi_fly_ids::{IdentityTracker, IdentityTrackerConfig};
pub use precomputed_bg::{PrecomputedBgConfig, PrecomputedBgTracker};

/// History entries older than this (relative to the newest) are dropped.
pub const MAX_HISTORY_MS: i64 = 250 * 1000;
/// Positions are re-emitted as inferred for at most this long after the last real detection.
pub const MAX_INFERENCE_MS: i64 = 30 * 1000;

/// Past positions of one tracker, most recent last.
#[derive(Debug, Clone, Default)]
pub struct History {
    positions: VecDeque<Vec<DataPoint>>,
    times: VecDeque<i64>,
    last_time_point: Option<i64>,
    last_non_inferred_time: Option<i64>,
}

impl History {
    pub fn positions(&self) -> &VecDeque<Vec<DataPoint>> {
        &self.positions
    }

    pub fn times(&self) -> &VecDeque<i64> {
        &self.times
    }

    /// The last timestamp presented to the tracker, found or not.
    pub fn last_time_point(&self) -> Option<i64> {
        self.last_time_point
    }

    pub fn last_positions(&self) -> Option<&[DataPoint]> {
        self.positions.back().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn record(&mut self, t: i64, points: Vec<DataPoint>) {
        self.positions.push_back(points);
        self.times.push_back(t);
        while self.times.len() > 2
            && self.times.back().zip(self.times.front()).is_some_and(|(b, f)| b - f > MAX_HISTORY_MS)
        {
            self.positions.pop_front();
            self.times.pop_front();
        }
    }

    /// The last positions, if a real detection happened recently enough.
    fn infer(&self, t: i64) -> Option<Vec<DataPoint>> {
        let last_real = self.last_non_inferred_time?;
        if t - last_real > MAX_INFERENCE_MS {
            return None;
        }
        self.positions.back().filter(|p| !p.is_empty()).cloned()
    }
}

pub trait Tracker: Send {
    /// Locates animals in a ROI sub-frame. `mask` has the sub-frame's size.
    fn find_position(&mut self, sub_frame: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>>;

    fn roi(&self) -> &Roi;

    fn kind(&self) -> TrackerKind;

    fn history(&self) -> &History;

    fn history_mut(&mut self) -> &mut History;

    /// Tracks one full frame at time `t` (ms). No-position frames never escape:
    /// they yield the recent positions flagged as inferred, or an empty list.
    fn track(&mut self, t: i64, frame: &GrayImage) -> Result<Vec<DataPoint>> {
        if let Some(last) = self.history().last_time_point() {
            if t <= last {
                debug!(
                    "ROI {}: frame at {t} ms does not follow {last} ms, ignored",
                    self.roi().idx()
                );
                return Ok(Vec::new());
            }
        }

        let (sub_frame, mask) = self.roi().apply(frame)?;
        self.history_mut().last_time_point = Some(t);

        match self.find_position(&sub_frame, &mask, t) {
            Ok(mut points) if !points.is_empty() => {
                for p in &mut points {
                    p.append(Variable::is_inferred(false));
                }
                let history = self.history_mut();
                history.last_non_inferred_time = Some(t);
                history.record(t, points.clone());
                Ok(points)
            }
            Ok(_) => Ok(Vec::new()),
            Err(Error::NoPosition(reason)) => {
                debug!("ROI {}: no position at {t} ms ({reason:?})", self.roi().idx());
                let Some(mut points) = self.history().infer(t) else {
                    return Ok(Vec::new());
                };
                for p in &mut points {
                    p.append(Variable::is_inferred(true));
                }
                self.history_mut().record(t, points.clone());
                Ok(points)
            }
            Err(e) => Err(e),
        }
    }
}

/// Fixed or adaptive foreground threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdConfig {
    pub adaptive: bool,
    pub fixed: u8,
    pub min: u8,
    pub max: u8,
}

impl ThresholdConfig {
    /// Thresholds `foreground` in place and returns the cut used.
    pub fn apply(&self, foreground: &mut GrayImage) -> u8 {
        let cut = if self.adaptive {
            segmentation::adaptive_threshold(foreground, self.min, self.max)
        } else {
            self.fixed
        };
        segmentation::threshold_to_zero(foreground, cut);
        cut
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    AdaptiveBg,
    MultiFly,
    MultiFlyIds,
    PrecomputedBg,
}

impl TrackerKind {
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse::<Self>()
            .map_err(|_| Error::Setup(format!("unknown tracker kind: {name}")))
    }
}

/// Deserialises a tracker config, treating `null` as "all defaults".
pub(crate) fn parse_options<T: DeserializeOwned + Default>(options: &serde_json::Value) -> Result<T> {
    if options.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(options.clone())?)
}

/// Builds a tracker of `kind` for `roi` from a JSON option mapping.
pub fn build_tracker(kind: TrackerKind, roi: Arc<Roi>, options: &serde_json::Value) -> Result<Box<dyn Tracker>> {
    Ok(match kind {
        TrackerKind::AdaptiveBg => Box::new(AdaptiveBgTracker::new(roi, parse_options(options)?)),
        TrackerKind::MultiFly => Box::new(MultiFlyTracker::new(roi, parse_options(options)?)),
        TrackerKind::MultiFlyIds => Box::new(IdentityTracker::new(roi, parse_options(options)?)),
        TrackerKind::PrecomputedBg => Box::new(PrecomputedBgTracker::new(roi, parse_options(options)?)),
    })
}
