// THEORY:
// Segmentation is the layer that decides which pixels belong to animals. It turns
// a pre-processed ROI crop and a background estimate into a handful of candidate
// contours. It holds no state; every tracker calls the same steps in its own
// order.
//
// Pipeline:
// 1.  **Subtraction**: `frame - background`, clamped at zero. Only pixels brighter
//     than the background survive (pre-processing already inverted dark animals).
// 2.  **Threshold**: a fixed cut, or an adaptive one at 30% of the mean non-zero
//     difference clamped to `[min, max]`. Sub-threshold pixels are zeroed; the rest
//     keep their magnitude.
// 3.  **Health Check**: before any contour is traced, the share of differing
//     pixels must be strictly positive and at most `max_area_ratio`. A violation is
//     a no-position frame; what the tracker does with its background in that case is
//     its own policy.
// 4.  **Morphological Filter** (optional): opening removes specks, closing mends
//     torn blobs, then connected components outside an area band are erased.
// 5.  **Contours**: only outermost outlines are traced (holes and blobs nested in
//     holes are ignored) and each is simplified with a 1.2 px tolerance.
//
// `ForegroundModel` is the one stateful helper: a pool of recently accepted blob
// areas that learns how big an animal is and rejects outliers.

use crate::core_modules::contour::Contour;
use crate::error::{NoPositionReason, Result, no_position};
use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::geometry::approximate_polygon_dp;
use imageproc::morphology::{close, open};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::Deserialize;
use std::collections::VecDeque;

/// Tolerance used to simplify traced outlines, in pixels.
pub const CONTOUR_TOLERANCE: f64 = 1.2;

pub mod segmentation {
    use super::*;

    /// Pixel-wise `frame - background`, clamped at zero.
    pub fn subtract(frame: &GrayImage, background: &GrayImage) -> GrayImage {
        GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
            let bg = if x < background.width() && y < background.height() {
                background.get_pixel(x, y)[0]
            } else {
                0
            };
            Luma([frame.get_pixel(x, y)[0].saturating_sub(bg)])
        })
    }

    /// 30% of the mean non-zero difference, clamped to `[min, max]`.
    pub fn adaptive_threshold(foreground: &GrayImage, min: u8, max: u8) -> u8 {
        let (mut sum, mut n) = (0u64, 0u64);
        for p in foreground.pixels().filter(|p| p[0] > 0) {
            sum += p[0] as u64;
            n += 1;
        }
        if n == 0 {
            return min;
        }
        let mean = sum as f64 / n as f64;
        (mean * 0.3).clamp(min as f64, max.max(min) as f64).round() as u8
    }

    /// Zeroes every pixel at or below `threshold`; the rest keep their value.
    pub fn threshold_to_zero(foreground: &mut GrayImage, threshold: u8) {
        for p in foreground.pixels_mut() {
            if p[0] <= threshold {
                p[0] = 0;
            }
        }
    }

    /// Share of the masked area that is non-zero in `foreground`.
    pub fn foreground_proportion(foreground: &GrayImage, mask: &GrayImage) -> f64 {
        let (mut lit, mut area) = (0u64, 0u64);
        for (p, m) in foreground.pixels().zip(mask.pixels()) {
            if m[0] > 0 {
                area += 1;
                if p[0] > 0 {
                    lit += 1;
                }
            }
        }
        if area == 0 { 0.0 } else { lit as f64 / area as f64 }
    }

    /// Fails with a no-position outcome when nothing or too much differs.
    /// Returns the proportion otherwise.
    pub fn check_health(foreground: &GrayImage, mask: &GrayImage, max_area_ratio: f64) -> Result<f64> {
        let proportion = foreground_proportion(foreground, mask);
        if proportion == 0.0 {
            return no_position(NoPositionReason::NoForeground);
        }
        if proportion > max_area_ratio {
            return no_position(NoPositionReason::TooMuchForeground);
        }
        Ok(proportion)
    }

    /// Non-zero pixels become 255.
    pub fn binarize(foreground: &GrayImage) -> GrayImage {
        GrayImage::from_fn(foreground.width(), foreground.height(), |x, y| {
            Luma([if foreground.get_pixel(x, y)[0] > 0 { 255 } else { 0 }])
        })
    }

    /// Opening then closing with a 3x3 kernel, then erases connected components
    /// whose pixel count lies outside `[min_area, max_area]`.
    pub fn morphological_filter(binary: &GrayImage, min_area: f64, max_area: f64) -> GrayImage {
        let cleaned = close(&open(binary, Norm::LInf, 1), Norm::LInf, 1);
        let labels = connected_components(&cleaned, Connectivity::Eight, Luma([0u8]));

        let mut areas: Vec<u64> = Vec::new();
        for p in labels.pixels() {
            let label = p[0] as usize;
            if label == 0 {
                continue;
            }
            if areas.len() <= label {
                areas.resize(label + 1, 0);
            }
            areas[label] += 1;
        }

        GrayImage::from_fn(cleaned.width(), cleaned.height(), |x, y| {
            let label = labels.get_pixel(x, y)[0] as usize;
            let keep = label > 0 && {
                let area = areas[label] as f64;
                area >= min_area && area <= max_area
            };
            Luma([if keep { 255 } else { 0 }])
        })
    }

    /// Outermost outlines of the non-zero regions, simplified with `tolerance`.
    pub fn external_contours(binary: &GrayImage, tolerance: f64) -> Vec<Contour> {
        find_contours::<i32>(binary)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .map(|c| {
                if c.points.len() > 2 {
                    Contour::new(approximate_polygon_dp(&c.points, tolerance, true))
                } else {
                    Contour::new(c.points)
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ForegroundModelConfig {
    pub sample_size: usize,
    /// Hard `(min, max)` area band, always enforced.
    pub normal_limits: (f64, f64),
    /// Areas further than `tolerance * mean` from the pool mean are outliers.
    pub tolerance: f64,
}

impl Default for ForegroundModelConfig {
    fn default() -> Self {
        Self {
            sample_size: 400,
            normal_limits: (50.0, 200.0),
            tolerance: 0.8,
        }
    }
}

/// Learns the typical blob area and rejects outliers.
#[derive(Debug, Clone)]
pub struct ForegroundModel {
    config: ForegroundModelConfig,
    pool: VecDeque<f64>,
}

impl ForegroundModel {
    pub fn new(config: ForegroundModelConfig) -> Self {
        Self {
            pool: VecDeque::with_capacity(config.sample_size),
            config,
        }
    }

    pub fn config(&self) -> &ForegroundModelConfig {
        &self.config
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    fn mean(&self) -> f64 {
        if self.pool.is_empty() {
            return 0.0;
        }
        self.pool.iter().sum::<f64>() / self.pool.len() as f64
    }

    /// Accepted areas join the pool.
    pub fn is_valid(&mut self, area: f64) -> bool {
        let (min, max) = self.config.normal_limits;
        if area < min || area > max {
            return false;
        }

        if self.pool.len() >= self.config.sample_size {
            let mean = self.mean();
            if (area - mean).abs() > self.config.tolerance * mean {
                return false;
            }
            self.pool.pop_front();
        }
        self.pool.push_back(area);
        true
    }
}

impl Default for ForegroundModel {
    fn default() -> Self {
        Self::new(ForegroundModelConfig::default())
    }
}
