// THEORY:
// A `TrackingUnit` is the pairing the orchestration layer works with: one ROI and
// the one tracker that watches it. The unit owns its tracker outright, so moving
// a unit onto a worker moves every scratch buffer and every piece of background
// state with it, and nothing is ever shared between ROIs.
//
// Output from the tracker is relative to the ROI's top-left corner;
// `last_positions(true)` shifts it back into frame coordinates for collaborators
// that draw on, or reason about, the whole frame.

use crate::core_modules::data_point::DataPoint;
use crate::core_modules::roi::Roi;
use crate::error::Result;
use crate::trackers::{Tracker, TrackerKind, build_tracker};
use image::GrayImage;
use std::sync::Arc;

pub struct TrackingUnit {
    roi: Arc<Roi>,
    tracker: Box<dyn Tracker>,
}

impl TrackingUnit {
    /// Builds the tracker of `kind` for `roi` from a JSON option mapping.
    pub fn new(kind: TrackerKind, roi: Roi, options: &serde_json::Value) -> Result<Self> {
        let roi = Arc::new(roi);
        let tracker = build_tracker(kind, Arc::clone(&roi), options)?;
        Ok(Self { roi, tracker })
    }

    /// Wraps an already built tracker.
    pub fn from_tracker(tracker: Box<dyn Tracker>) -> Self {
        let roi = Arc::new(tracker.roi().clone());
        Self { roi, tracker }
    }

    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    pub fn tracker(&self) -> &dyn Tracker {
        self.tracker.as_ref()
    }

    pub fn tracker_mut(&mut self) -> &mut dyn Tracker {
        self.tracker.as_mut()
    }

    /// Tracks one full frame. See `Tracker::track`.
    pub fn track(&mut self, t: i64, frame: &GrayImage) -> Result<Vec<DataPoint>> {
        self.tracker.track(t, frame)
    }

    /// The most recent records, in frame coordinates when `absolute`.
    pub fn last_positions(&self, absolute: bool) -> Option<Vec<DataPoint>> {
        let last = self.tracker.history().last_positions()?;
        Some(if absolute {
            last.iter().map(|p| p.to_absolute(&self.roi)).collect()
        } else {
            last.to_vec()
        })
    }
}
