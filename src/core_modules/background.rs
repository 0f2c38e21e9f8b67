// THEORY:
// The `BackgroundModel` is the memory of the tracking pipeline. It keeps a running
// estimate of what the ROI looks like *without* any animal in it, so that anything
// differing from it can be called foreground.
//
// Key architectural principles:
// 1.  **Exponential Running Average**: every update blends the new frame into a
//     floating point accumulator, `acc = (1 - alpha) * acc + alpha * frame`. The
//     blend assumes a roughly constant frame interval; there is no dt weighting.
// 2.  **Seeding**: the very first frame *is* the background. Nothing is blended on
//     that call, and the rounded accumulator equals the frame exactly.
// 3.  **Adaptive Learning Rate**: alpha moves geometrically between a minimum and a
//     maximum. Trackers raise it when segmentation looks wrong (nothing or too much
//     differs) so the model catches up with persistent change, and lower it while
//     tracking is clean so a resting animal does not fade into the scene. It starts
//     at the maximum.
// 4.  **Foreground Exclusion**: an optional mask marks pixels that must keep their
//     previous estimate (the animal itself). The mask is grown by one pixel first to
//     cover the blurred rim around a detection.
//
// `FixedBackground` is the offline counterpart: a static background computed once
// from a stack of frames, by per-pixel mean or median.

use crate::error::{Error, Result};
use image::{GrayImage, ImageBuffer, Luma, imageops};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use serde::Deserialize;
use std::borrow::Cow;

pub type Accumulator = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Bounds and step of the background learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LearningRateConfig {
    pub min_learning_rate: f32,
    pub max_learning_rate: f32,
    /// Multiplicative step applied by `increase`/`decrease`.
    pub step: f32,
}

impl Default for LearningRateConfig {
    fn default() -> Self {
        Self {
            min_learning_rate: 0.0005,
            max_learning_rate: 0.05,
            step: 1.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundModel {
    config: LearningRateConfig,
    learning_rate: f32,
    accumulator: Option<Accumulator>,
    last_t: Option<i64>,
}

impl BackgroundModel {
    pub fn new(config: LearningRateConfig) -> Self {
        Self {
            learning_rate: config.max_learning_rate,
            config,
            accumulator: None,
            last_t: None,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.accumulator.is_some()
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn last_t(&self) -> Option<i64> {
        self.last_t
    }

    /// The background estimate in native pixel type, `None` before the first update.
    pub fn bg_img(&self) -> Option<GrayImage> {
        self.accumulator.as_ref().map(|acc| {
            GrayImage::from_fn(acc.width(), acc.height(), |x, y| {
                Luma([acc.get_pixel(x, y)[0].round().clamp(0.0, 255.0) as u8])
            })
        })
    }

    pub fn increase_learning_rate(&mut self) {
        self.learning_rate = self.clamp(self.learning_rate * self.config.step);
    }

    pub fn decrease_learning_rate(&mut self) {
        self.learning_rate = self.clamp(self.learning_rate / self.config.step);
    }

    fn clamp(&self, rate: f32) -> f32 {
        rate.clamp(self.config.min_learning_rate, self.config.max_learning_rate)
    }

    /// Blends `frame` into the estimate. Non-zero pixels of `exclude` (after a
    /// one-pixel dilation) keep their previous value. The first call only seeds.
    pub fn update(&mut self, frame: &GrayImage, t: i64, exclude: Option<&GrayImage>) -> Result<()> {
        self.last_t = Some(t);

        if self.accumulator.is_none() {
            self.accumulator = Some(Accumulator::from_fn(
                frame.width(),
                frame.height(),
                |x, y| Luma([frame.get_pixel(x, y)[0] as f32]),
            ));
            return Ok(());
        }
        let alpha = self.learning_rate;
        let Some(acc) = self.accumulator.as_mut() else {
            return Ok(());
        };

        if acc.dimensions() != frame.dimensions() {
            return Err(Error::Setup(format!(
                "background is {:?} but frame is {:?}",
                acc.dimensions(),
                frame.dimensions()
            )));
        }

        let grown = match exclude {
            Some(mask) if mask.dimensions() == frame.dimensions() => {
                Some(dilate(mask, Norm::LInf, 1))
            }
            Some(_) => {
                return Err(Error::Setup(
                    "background exclusion mask does not match the frame".into(),
                ));
            }
            None => None,
        };

        for (x, y, px) in acc.enumerate_pixels_mut() {
            if grown.as_ref().is_some_and(|m| m.get_pixel(x, y)[0] > 0) {
                continue;
            }
            let value = frame.get_pixel(x, y)[0] as f32;
            px[0] = (1.0 - alpha) * px[0] + alpha * value;
        }
        Ok(())
    }
}

impl Default for BackgroundModel {
    fn default() -> Self {
        Self::new(LearningRateConfig::default())
    }
}

/// How `FixedBackground` collapses its frame stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMethod {
    Mean,
    #[default]
    Median,
}

pub struct FixedBackground;

impl FixedBackground {
    /// Collapses `frames` into one image. Frames whose size differs from the first
    /// one are resized to it.
    pub fn compute(frames: &[GrayImage], method: BackgroundMethod) -> Result<GrayImage> {
        let first = frames
            .first()
            .ok_or_else(|| Error::Setup("no frames to compute a background from".into()))?;
        let (w, h) = first.dimensions();

        let stack: Vec<Cow<'_, GrayImage>> = frames
            .iter()
            .map(|f| {
                if f.dimensions() == (w, h) {
                    Cow::Borrowed(f)
                } else {
                    Cow::Owned(imageops::resize(f, w, h, imageops::FilterType::Triangle))
                }
            })
            .collect();

        let mut column = Vec::with_capacity(stack.len());
        Ok(GrayImage::from_fn(w, h, |x, y| {
            column.clear();
            column.extend(stack.iter().map(|f| f.get_pixel(x, y)[0]));
            let value = match method {
                BackgroundMethod::Mean => {
                    let sum: u32 = column.iter().map(|&v| v as u32).sum();
                    (sum as f32 / column.len() as f32).round() as u8
                }
                BackgroundMethod::Median => {
                    column.sort_unstable();
                    let mid = column.len() / 2;
                    if column.len() % 2 == 0 {
                        ((column[mid - 1] as u16 + column[mid] as u16 + 1) / 2) as u8
                    } else {
                        column[mid]
                    }
                }
            };
            Luma([value])
        }))
    }
}
