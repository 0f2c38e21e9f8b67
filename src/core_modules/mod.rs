// THEORY:
// The building blocks every tracker is assembled from, leaf first:
// telemetry values and the records that carry them, the ROI that crops frames,
// pre-processing, the background model, segmentation, contour geometry, the
// appearance model and the identity state for multi-animal ROIs.

pub mod background;
pub mod contour;
pub mod data_point;
pub mod identity;
pub mod object_model;
pub mod preprocess;
pub mod roi;
pub mod segmentation;
pub mod variables;
