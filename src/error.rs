// THEORY:
// Tracking has exactly one *expected* failure: a frame in which no animal can be
// located with confidence. It happens constantly (seeding frames, empty arenas,
// lighting flicker) and the caller is expected to swallow it and move on. Every
// other failure is a configuration or programming problem and should be loud.
//
// The `Error` enum keeps the two families apart so a caller can match on
// `Error::NoPosition(_)` without string inspection. The reason attached to a
// no-position outcome is only informational (it feeds debug logs); it never
// changes how the caller should react.

use thiserror::Error;

/// Why a frame produced no position. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoPositionReason {
    /// The frame was used to seed the background model.
    Seeding,
    /// The masked mean intensity of the ROI was zero.
    BlankFrame,
    /// No pixel differed from the background.
    NoForeground,
    /// Too large a share of the ROI differed from the background.
    TooMuchForeground,
    /// Foreground existed but no contour could be traced.
    NoContours,
    /// Contours existed but none passed the validity rules.
    NoValidContours,
    /// Several candidates and no way to choose between them yet.
    Ambiguous,
    /// The best candidate looked too unlike the learned animal.
    Unlikely,
    /// The candidate's rotated rectangle is larger than the frame allows.
    Degenerate,
    /// Identities are still being established.
    Bootstrapping,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no position found ({0:?})")]
    NoPosition(NoPositionReason),

    #[error("invalid variable kind: {0}")]
    InvalidKind(String),

    #[error("tracking setup failed: {0}")]
    Setup(String),

    #[error("invalid tracker configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("worker pool error: {0}")]
    Pool(String),
}

impl Error {
    pub fn is_no_position(&self) -> bool {
        matches!(self, Error::NoPosition(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shorthand used throughout the trackers.
pub(crate) fn no_position<T>(reason: NoPositionReason) -> Result<T> {
    Err(Error::NoPosition(reason))
}
