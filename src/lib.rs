// THEORY:
// This file is the entry point for the `ethotrack` library crate. It exposes the
// tracking core of a behavioural-monitoring rig: given timestamped greyscale
// frames and a set of fixed regions of interest, it reports where the animals in
// each region are, frame after frame.
//
// The layers, leaf first:
// 1.  `core_modules`: telemetry values and position records, ROI geometry,
//     pre-processing, the background model, segmentation, contour geometry, the
//     appearance model and multi-animal identity state.
// 2.  `trackers`: the `Tracker` contract and its variants, built by name from a
//     JSON option mapping.
// 3.  `tracking_unit`: one ROI paired with one tracker.
// 4.  `parallel_pipeline`: a worker pool that tracks every ROI of a frame
//     concurrently while keeping each tracker confined to one worker.
//
// The library logs through the `log` facade and never installs a logger.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod trackers;
pub mod tracking_unit;

pub use core_modules::data_point::DataPoint;
pub use core_modules::roi::Roi;
pub use core_modules::variables::{Variable, VariableKind};
pub use error::{Error, NoPositionReason, Result};
pub use parallel_pipeline::{RoiOutput, TrackerPool};
pub use trackers::{Tracker, TrackerKind, build_tracker};
pub use tracking_unit::TrackingUnit;
