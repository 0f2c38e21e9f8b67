// THEORY:
// `IdentityState` keeps N animals apart across frames without any appearance
// model: only geometry. Every label owns the most recent outline assigned to it,
// and each new frame's outlines are matched to labels by pixel overlap with those
// previous outlines.
//
// Lifecycle:
// 1.  **Bootstrap**: labels are handed out only after the segmentation has seen
//     exactly N outlines on more than `settle_frames` consecutive frames. Any frame
//     with a different count resets the streak. Until then nothing is reported.
// 2.  **Steady State**: labels `1..=N` always exist; a label nobody claims this
//     frame keeps its previous outline (the animal is assumed to be resting or
//     hidden, not gone).
//
// Matching order (most certain evidence first):
// 1.  **Single Overlap**: an outline that overlaps exactly one old label takes it.
//     When several outlines overlap the same single label, the largest overlap wins
//     and the rest are treated as orphans.
// 2.  **Merged Blob**: an outline overlapping several still-free labels is split
//     pixel by pixel to the nearest old centroid (ties go to the lowest label). The
//     first outline traced in each part goes to that part's label; an empty part
//     leaves its label untouched.
// 3.  **Orphans**: outlines overlapping nothing go to the nearest label that is
//     still free this frame, which then counts as claimed.

use crate::core_modules::contour::{Contour, pixel_centroid};
use crate::core_modules::data_point::DataPoint;
use crate::core_modules::segmentation::{CONTOUR_TOLERANCE, segmentation};
use crate::core_modules::variables::Variable;
use crate::error::{NoPositionReason, Result, no_position};
use image::{GrayImage, Luma};
use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;

pub type Label = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub n_objects: usize,
    /// Identities lock once the full-count streak exceeds this.
    pub settle_frames: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            n_objects: 7,
            settle_frames: 5,
        }
    }
}

/// An old label's footprint, precomputed once per frame.
struct Footprint {
    mask: GrayImage,
    centroid: (f64, f64),
}

#[derive(Debug, Clone, Default)]
pub struct IdentityState {
    config: IdentityConfig,
    identities: BTreeMap<Label, Contour>,
    consecutive_full_detections: u32,
}

impl IdentityState {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            identities: BTreeMap::new(),
            consecutive_full_detections: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.identities.is_empty()
    }

    pub fn identities(&self) -> &BTreeMap<Label, Contour> {
        &self.identities
    }

    pub fn consecutive_full_detections(&self) -> u32 {
        self.consecutive_full_detections
    }

    pub fn n_objects(&self) -> usize {
        self.config.n_objects
    }

    /// Feeds one frame's valid outlines. Fails with a bootstrapping no-position
    /// outcome while identities are not yet locked.
    pub fn update(&mut self, contours: Vec<Contour>, width: u32, height: u32) -> Result<()> {
        if !self.is_locked() {
            return self.bootstrap(contours);
        }
        self.reassign(contours, width, height);
        Ok(())
    }

    fn bootstrap(&mut self, contours: Vec<Contour>) -> Result<()> {
        if contours.len() != self.config.n_objects {
            if self.consecutive_full_detections > 0 {
                debug!(
                    "Saw {} objects instead of {}, restarting the identity streak",
                    contours.len(),
                    self.config.n_objects
                );
            }
            self.consecutive_full_detections = 0;
            return no_position(NoPositionReason::Bootstrapping);
        }

        self.consecutive_full_detections += 1;
        if self.consecutive_full_detections <= self.config.settle_frames {
            return no_position(NoPositionReason::Bootstrapping);
        }

        self.identities = (1..).zip(contours).collect();
        info!(
            "Locked {} identities after {} consecutive full frames",
            self.identities.len(),
            self.consecutive_full_detections
        );
        Ok(())
    }

    fn reassign(&mut self, contours: Vec<Contour>, width: u32, height: u32) {
        let footprints: BTreeMap<Label, Footprint> = self
            .identities
            .iter()
            .map(|(&label, contour)| {
                let mask = contour.to_mask(width, height);
                let centroid = pixel_centroid(&mask).unwrap_or_else(|| contour.centroid(width, height));
                (label, Footprint { mask, centroid })
            })
            .collect();

        // --- 1. Overlap Table ---
        // For every new outline, the old labels it touches and by how many pixels.
        let candidates: Vec<(Contour, GrayImage, Vec<(Label, u64)>)> = contours
            .into_iter()
            .map(|contour| {
                let mask = contour.to_mask(width, height);
                let overlaps = footprints
                    .iter()
                    .filter_map(|(&label, fp)| {
                        let n = overlap(&mask, &fp.mask);
                        (n > 0).then_some((label, n))
                    })
                    .collect();
                (contour, mask, overlaps)
            })
            .collect();

        let mut assigned: BTreeMap<Label, Contour> = BTreeMap::new();
        let mut orphans: Vec<usize> = Vec::new();
        let mut merged: Vec<usize> = Vec::new();

        // --- 2. Single Overlaps ---
        let mut best_single: BTreeMap<Label, (usize, u64)> = BTreeMap::new();
        for (i, (_, _, overlaps)) in candidates.iter().enumerate() {
            match overlaps.as_slice() {
                [] => orphans.push(i),
                [(label, n)] => match best_single.get(label) {
                    Some(&(_, m)) if m >= *n => orphans.push(i),
                    Some(&(j, _)) => {
                        orphans.push(j);
                        best_single.insert(*label, (i, *n));
                    }
                    None => {
                        best_single.insert(*label, (i, *n));
                    }
                },
                _ => merged.push(i),
            }
        }
        for (&label, &(i, _)) in &best_single {
            assigned.insert(label, candidates[i].0.clone());
        }

        // --- 3. Merged Blobs ---
        for i in merged {
            let (contour, mask, overlaps) = &candidates[i];
            let free: Vec<Label> = overlaps
                .iter()
                .map(|(label, _)| *label)
                .filter(|label| !assigned.contains_key(label))
                .collect();

            match free.as_slice() {
                [] => orphans.push(i),
                [label] => {
                    assigned.insert(*label, contour.clone());
                }
                _ => {
                    for (label, part) in split_by_centroid(mask, &free, &footprints) {
                        if let Some(first) = segmentation::external_contours(&part, CONTOUR_TOLERANCE)
                            .into_iter()
                            .next()
                        {
                            assigned.insert(label, first);
                        }
                    }
                }
            }
        }

        // --- 4. Orphans ---
        orphans.sort_unstable();
        for i in orphans {
            let (contour, mask, _) = &candidates[i];
            let centroid = pixel_centroid(mask).unwrap_or_else(|| contour.centroid(width, height));
            let nearest = footprints
                .iter()
                .filter(|(label, _)| !assigned.contains_key(label))
                .map(|(&label, fp)| (label, distance(centroid, fp.centroid)))
                .fold(None, |best: Option<(Label, f64)>, (label, d)| match best {
                    Some((_, bd)) if bd <= d => best,
                    _ => Some((label, d)),
                });
            if let Some((label, _)) = nearest {
                assigned.insert(label, contour.clone());
            }
        }

        // --- 5. Carry Over ---
        // Unclaimed labels keep their previous outline.
        for (label, contour) in assigned {
            self.identities.insert(label, contour);
        }
    }

    /// One record per label, skipping labels whose rectangle is degenerate.
    pub fn positions(&self, width: u32, height: u32) -> Vec<DataPoint> {
        self.identities
            .iter()
            .filter_map(|(&label, contour)| {
                let rect = contour.min_area_rect().normalized();
                if rect.exceeds_frame(width, height) {
                    debug!("Label {label} has a degenerate rectangle, skipped this frame");
                    return None;
                }
                let mut point = DataPoint::new(rect.to_variables());
                point.append(Variable::id(label as i64));
                Some(point)
            })
            .collect()
    }

    /// Exclusion mask covering every labelled animal, for the background update.
    pub fn exclusion_mask(&self, width: u32, height: u32, scale: f64) -> GrayImage {
        let mut mask = GrayImage::new(width, height);
        for contour in self.identities.values() {
            contour.min_area_rect().normalized().stamp_ellipse(&mut mask, scale, 255);
        }
        mask
    }
}

fn overlap(a: &GrayImage, b: &GrayImage) -> u64 {
    a.pixels()
        .zip(b.pixels())
        .filter(|(p, q)| p[0] > 0 && q[0] > 0)
        .count() as u64
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

/// Partitions the pixels of `mask` between `labels` by nearest old centroid.
/// `labels` is ascending, so strict comparison hands ties to the lowest label.
fn split_by_centroid(
    mask: &GrayImage,
    labels: &[Label],
    footprints: &BTreeMap<Label, Footprint>,
) -> Vec<(Label, GrayImage)> {
    let (w, h) = mask.dimensions();
    let mut parts: Vec<(Label, GrayImage)> = labels
        .iter()
        .map(|&label| (label, GrayImage::new(w, h)))
        .collect();

    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        let here = (x as f64, y as f64);
        let mut best: Option<(usize, f64)> = None;
        for (k, label) in labels.iter().enumerate() {
            let Some(fp) = footprints.get(label) else {
                continue;
            };
            let d = distance(here, fp.centroid);
            if best.is_none_or(|(_, bd)| d < bd) {
                best = Some((k, d));
            }
        }
        if let Some((k, _)) = best {
            parts[k].1.put_pixel(x, y, Luma([255]));
        }
    }
    parts
}
