// THEORY:
// The `ObjectModel` is a short-term memory of what the tracked animal looks like.
// Each confirmed detection contributes one row of appearance features:
//
// 1.  `log10(area + 1)`: size, on a log scale so a doubling is a fixed step.
// 2.  `short side + 1`: thickness of the minimum-area rectangle.
// 3.  `mean grey + 1`: brightness of the pixels inside the outline.
//
// Rows live in a fixed-size ring buffer. The model becomes *ready* once the ring
// has wrapped once, and only then is it trusted to arbitrate between several
// candidate blobs.
//
// `distance` scores a candidate as the mean negative log10 Gaussian likelihood of
// its features, each feature modelled independently by the buffer's mean and mean
// absolute deviation. Lower is more animal-like. A model that has not been fed for
// a minute is stale (the animal or the lighting may have changed) and resets.

use crate::core_modules::contour::Contour;
use image::GrayImage;
use log::warn;

pub const N_FEATURES: usize = 3;
pub type Features = [f64; N_FEATURES];

const DEFAULT_HISTORY_LENGTH: usize = 1000;
const MAX_UNUPDATED_MS: i64 = 60 * 1000;

#[derive(Debug, Clone)]
pub struct ObjectModel {
    history_length: usize,
    ring: Vec<Features>,
    idx: usize,
    ready: bool,
    last_updated: i64,
}

impl ObjectModel {
    pub fn new(history_length: usize) -> Self {
        let history_length = history_length.max(1);
        Self {
            history_length,
            ring: vec![[0.0; N_FEATURES]; history_length],
            idx: 0,
            ready: false,
            last_updated: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn reset(&mut self) {
        *self = Self::new(self.history_length);
    }

    /// Appearance features of `contour` measured on `grey`.
    pub fn compute_features(grey: &GrayImage, contour: &Contour) -> Features {
        let (w, h) = grey.dimensions();
        let mask = contour.to_mask(w, h);

        let (mut sum, mut n) = (0u64, 0u64);
        for (p, m) in grey.pixels().zip(mask.pixels()) {
            if m[0] > 0 {
                sum += p[0] as u64;
                n += 1;
            }
        }
        let mean_grey = if n == 0 { 0.0 } else { sum as f64 / n as f64 };
        let rect = contour.min_area_rect().normalized();

        [(contour.area() + 1.0).log10(), rect.size.1 + 1.0, mean_grey + 1.0]
    }

    pub fn update(&mut self, grey: &GrayImage, contour: &Contour, t: i64) {
        self.last_updated = t;
        self.ring[self.idx] = Self::compute_features(grey, contour);
        self.idx += 1;
        if self.idx == self.history_length {
            self.ready = true;
            self.idx = 0;
        }
    }

    /// Mean negative log10 likelihood of `features`; 0 when the model cannot tell.
    pub fn distance(&mut self, features: &Features, t: i64) -> f64 {
        if t - self.last_updated > MAX_UNUPDATED_MS {
            warn!("Appearance model not updated for {} ms, resetting", t - self.last_updated);
            self.reset();
            return 0.0;
        }

        // While warming up, the next empty row takes part too, which keeps the
        // spread wide until real rows dominate.
        let rows = if self.ready {
            &self.ring[..]
        } else {
            &self.ring[..(self.idx + 1).min(self.history_length)]
        };
        if rows.is_empty() {
            return 0.0;
        }
        let n = rows.len() as f64;

        let mut total = 0.0;
        for k in 0..N_FEATURES {
            let mean = rows.iter().map(|r| r[k]).sum::<f64>() / n;
            let mad = rows.iter().map(|r| (r[k] - mean).abs()).sum::<f64>() / n;
            if mad == 0.0 {
                return 0.0;
            }
            let a = 1.0 / (mad * (2.0 * std::f64::consts::PI).sqrt());
            let b = (-(features[k] - mean).powi(2) / (2.0 * mad * mad)).exp();
            let likelihood = a * b;
            if likelihood == 0.0 {
                return 0.0;
            }
            total += likelihood.log10();
        }
        -total / N_FEATURES as f64
    }
}

impl Default for ObjectModel {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::point::Point;

    fn square(x: i32, y: i32, side: i32) -> Contour {
        Contour::new(vec![
            Point::new(x, y),
            Point::new(x + side, y),
            Point::new(x + side, y + side),
            Point::new(x, y + side),
        ])
    }

    fn grey() -> GrayImage {
        GrayImage::from_fn(40, 40, |x, _| Luma([(100 + x) as u8]))
    }

    #[test]
    fn features_describe_size_thickness_and_brightness() {
        let img = GrayImage::from_pixel(20, 20, Luma([99]));
        let f = ObjectModel::compute_features(&img, &square(2, 2, 9));
        assert!((f[0] - 82f64.log10()).abs() < 1e-9);
        assert!((f[1] - 10.0).abs() < 1e-9);
        assert!((f[2] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn becomes_ready_after_one_full_ring() {
        let mut model = ObjectModel::new(5);
        let img = grey();
        for t in 0..4 {
            model.update(&img, &square(t as i32, 3, 6 + t as i32), t);
            assert!(!model.is_ready());
        }
        model.update(&img, &square(4, 3, 10), 4);
        assert!(model.is_ready());
    }

    #[test]
    fn similar_candidates_score_lower_than_odd_ones() {
        let mut model = ObjectModel::new(10);
        let img = grey();
        for t in 0..10 {
            model.update(&img, &square(5, 5, 8 + (t % 3) as i32), t);
        }
        let alike = ObjectModel::compute_features(&img, &square(5, 5, 9));
        let odd = ObjectModel::compute_features(&img, &square(2, 2, 30));
        assert!(model.distance(&alike, 10) < model.distance(&odd, 10));
    }

    #[test]
    fn warm_up_statistics_include_the_next_empty_row() {
        let mut model = ObjectModel::new(10);
        let img = grey();
        let shape = square(5, 5, 8);
        assert_eq!(model.distance(&ObjectModel::compute_features(&img, &shape), 0), 0.0);

        model.update(&img, &shape, 0);
        let f = ObjectModel::compute_features(&img, &shape);
        // One real row and one empty row: mean and spread are both f / 2.
        let expected = f
            .iter()
            .map(|&v| {
                let spread = v / 2.0;
                let likelihood = (-0.5f64).exp() / (spread * (2.0 * std::f64::consts::PI).sqrt());
                -likelihood.log10()
            })
            .sum::<f64>()
            / N_FEATURES as f64;
        let d = model.distance(&f, 1);
        assert!((d - expected).abs() < 1e-9, "{d} vs {expected}");
        assert!(d > 0.0 && d < 5.5);
    }

    #[test]
    fn stale_model_resets() {
        let mut model = ObjectModel::new(2);
        let img = grey();
        model.update(&img, &square(1, 1, 5), 0);
        model.update(&img, &square(1, 1, 7), 1);
        assert!(model.is_ready());

        let f = ObjectModel::compute_features(&img, &square(1, 1, 20));
        assert_eq!(model.distance(&f, 1 + MAX_UNUPDATED_MS + 1), 0.0);
        assert!(!model.is_ready());
    }
}
