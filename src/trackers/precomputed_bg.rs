// THEORY:
// The `PrecomputedBgTracker` runs the multi-animal pipeline against a background
// that was computed once, offline, from a sample of frames (per-pixel median by
// default). Such a background never learns, so an animal that sits still for
// minutes is never absorbed into it.
//
// Key principles:
// 1.  **Frozen Background**: once set, nothing the tracker sees changes the
//     background. A flooded or empty frame is simply a no-position frame.
// 2.  **Same Pre-processing**: sample frames go through the ROI crop and the very
//     pre-processing used at tracking time, so background and frames are
//     comparable pixel for pixel.
// 3.  **Fallback**: until a background is available the tracker behaves exactly
//     like an adaptive `MultiFlyTracker`, learning its own background.

use crate::core_modules::background::{BackgroundMethod, FixedBackground};
use crate::core_modules::data_point::DataPoint;
use crate::core_modules::roi::Roi;
use crate::error::{Error, Result};
use crate::trackers::multi_fly::{MultiFlyConfig, MultiFlyTracker};
use crate::trackers::{History, Tracker, TrackerKind};
use image::GrayImage;
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct PrecomputedBgConfig {
    #[serde(flatten)]
    pub tracking: MultiFlyConfig,
    pub background_method: BackgroundMethod,
}

pub struct PrecomputedBgTracker {
    inner: MultiFlyTracker,
    method: BackgroundMethod,
    background: Option<GrayImage>,
}

impl PrecomputedBgTracker {
    pub fn new(roi: Arc<Roi>, config: PrecomputedBgConfig) -> Self {
        Self {
            inner: MultiFlyTracker::new(roi, config.tracking),
            method: config.background_method,
            background: None,
        }
    }

    pub fn background(&self) -> Option<&GrayImage> {
        self.background.as_ref()
    }

    /// Installs a background already in pre-processed ROI coordinates. A ROI that
    /// overhangs the frame edge takes a background of its clamped crop size.
    pub fn set_background(&mut self, background: GrayImage) -> Result<()> {
        let (bw, bh) = background.dimensions();
        let (mw, mh) = self.inner.roi().mask().dimensions();
        if bw == 0 || bh == 0 || bw > mw || bh > mh {
            return Err(Error::Setup(format!(
                "background is {bw}x{bh} but ROI {} is {mw}x{mh}",
                self.inner.roi().idx()
            )));
        }
        self.background = Some(background);
        Ok(())
    }

    /// Computes and installs the background from full sample frames.
    /// Blank frames are skipped.
    pub fn compute_background(&mut self, frames: &[GrayImage]) -> Result<()> {
        let mut samples = Vec::with_capacity(frames.len());
        for frame in frames {
            let (sub_frame, mask) = self.inner.roi().apply(frame)?;
            match self.inner.preprocess(&sub_frame, &mask) {
                Ok(grey) => samples.push(grey),
                Err(e) if e.is_no_position() => debug!("Skipped a blank background sample"),
                Err(e) => return Err(e),
            }
        }
        let background = FixedBackground::compute(&samples, self.method)?;
        info!(
            "ROI {}: background computed from {} of {} frames ({:?})",
            self.inner.roi().idx(),
            samples.len(),
            frames.len(),
            self.method
        );
        self.background = Some(background);
        Ok(())
    }
}

impl Tracker for PrecomputedBgTracker {
    fn find_position(&mut self, sub_frame: &GrayImage, mask: &GrayImage, t: i64) -> Result<Vec<DataPoint>> {
        let Some(background) = self.background.as_ref() else {
            return self.inner.find_position(sub_frame, mask, t);
        };
        if background.dimensions() != sub_frame.dimensions() {
            return Err(Error::Setup(format!(
                "background is {:?} but the crop of ROI {} is {:?}",
                background.dimensions(),
                self.inner.roi().idx(),
                sub_frame.dimensions()
            )));
        }
        let grey = self.inner.preprocess(sub_frame, mask)?;
        Ok(self.inner.detect(&grey, background, mask)?.points)
    }

    fn roi(&self) -> &Roi {
        self.inner.roi()
    }

    fn kind(&self) -> TrackerKind {
        TrackerKind::PrecomputedBg
    }

    fn history(&self) -> &History {
        self.inner.history()
    }

    fn history_mut(&mut self) -> &mut History {
        self.inner.history_mut()
    }
}
