// THEORY:
// Raw ROI crops are not comparable across time: the camera's exposure drifts,
// lighting flickers, and the animal can be darker or brighter than the arena.
// Pre-processing turns a crop into a normalised grey image so that a plain
// `frame - background` subtraction picks out the animal.
//
// Steps, in order:
// 1.  **Blur**: a Gaussian of sigma 1.2 removes sensor noise that would otherwise
//     fragment small blobs.
// 2.  **Polarity**: with `darker_foreground` the image is inverted, so a dark fly
//     on a bright arena becomes bright on dark and survives a clamped subtraction.
// 3.  **Intensity Normalisation**: the image is scaled so its mean *inside the
//     mask* hits a target grey (128). With `adaptive_lighting` the target follows
//     the scene (100 when bright, 140 when dark) and extreme scenes are histogram
//     equalised first.
// 4.  **Masking**: pixels outside the ROI polygon are zeroed.
//
// A crop whose masked mean is zero carries no information at all and is reported
// as a no-position frame.

use crate::error::{NoPositionReason, Result, no_position};
use image::{GrayImage, Luma};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::gaussian_blur_f32;
use serde::Deserialize;

const BLUR_SIGMA: f32 = 1.2;
const TARGET_MEAN: f64 = 128.0;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub darker_foreground: bool,
    pub adaptive_lighting: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            darker_foreground: true,
            adaptive_lighting: false,
        }
    }
}

/// Mean of `image` over the non-zero pixels of `mask`. Zero when the mask is empty.
pub fn masked_mean(image: &GrayImage, mask: &GrayImage) -> f64 {
    let (mut sum, mut n) = (0u64, 0u64);
    for (p, m) in image.pixels().zip(mask.pixels()) {
        if m[0] > 0 {
            sum += p[0] as u64;
            n += 1;
        }
    }
    if n == 0 { 0.0 } else { sum as f64 / n as f64 }
}

pub fn preprocess(sub_frame: &GrayImage, mask: &GrayImage, config: &PreprocessConfig) -> Result<GrayImage> {
    let mut grey = gaussian_blur_f32(sub_frame, BLUR_SIGMA);
    if config.darker_foreground {
        image::imageops::invert(&mut grey);
    }

    let mut mean = masked_mean(&grey, mask);
    if mean == 0.0 {
        return no_position(NoPositionReason::BlankFrame);
    }

    let target = if config.adaptive_lighting {
        if !(60.0..=180.0).contains(&mean) {
            grey = equalize_histogram(&grey);
            mean = masked_mean(&grey, mask);
            if mean == 0.0 {
                return no_position(NoPositionReason::BlankFrame);
            }
        }
        if mean > 150.0 {
            100.0
        } else if mean < 80.0 {
            140.0
        } else {
            TARGET_MEAN
        }
    } else {
        TARGET_MEAN
    };

    let scale = target / mean;
    for (p, m) in grey.pixels_mut().zip(mask.pixels()) {
        *p = if m[0] > 0 {
            Luma([(p[0] as f64 * scale).round().clamp(0.0, 255.0) as u8])
        } else {
            Luma([0])
        };
    }
    Ok(grey)
}
