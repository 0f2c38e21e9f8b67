// THEORY:
// A `Roi` is a fixed region of the camera frame in which animals are tracked
// independently of every other region. Trackers never own the geometry; they hold
// a shared reference and use it for two things:
//
// 1.  **Cropping**: `apply` cuts the ROI's bounding rectangle out of a full frame
//     and returns it together with the polygon mask of the same size. The crop is
//     clamped to the frame, and an empty crop is a setup error (a ROI outside the
//     image is a configuration problem, not a per-frame glitch).
// 2.  **Coordinate conversion**: tracker output is relative to the ROI's top-left
//     corner; `offset` lets collaborators shift it back into frame coordinates.
//
// Regions are simple polygons without holes.

use crate::core_modules::contour::open_polygon;
use crate::error::{Error, Result};
use image::{GrayImage, Luma, imageops};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;

#[derive(Debug, Clone)]
pub struct Roi {
    idx: usize,
    value: i64,
    /// Upright bounding rectangle in frame coordinates: (x, y, w, h).
    rectangle: (i32, i32, u32, u32),
    /// Polygon mask sized to the bounding rectangle. 255 inside, 0 outside.
    mask: GrayImage,
}

impl Roi {
    /// Builds a ROI from a polygon expressed in frame coordinates.
    pub fn from_polygon(idx: usize, polygon: &[(i32, i32)]) -> Result<Self> {
        if polygon.len() < 3 {
            return Err(Error::Setup(format!(
                "ROI {idx} needs at least 3 vertices, got {}",
                polygon.len()
            )));
        }

        let min_x = polygon.iter().map(|p| p.0).min().unwrap_or(0);
        let min_y = polygon.iter().map(|p| p.1).min().unwrap_or(0);
        let max_x = polygon.iter().map(|p| p.0).max().unwrap_or(0);
        let max_y = polygon.iter().map(|p| p.1).max().unwrap_or(0);
        let w = (max_x - min_x + 1) as u32;
        let h = (max_y - min_y + 1) as u32;

        let local: Vec<Point<i32>> = polygon
            .iter()
            .map(|&(x, y)| Point::new(x - min_x, y - min_y))
            .collect();
        let local = open_polygon(&local);
        if local.len() < 3 {
            return Err(Error::Setup(format!("ROI {idx} has fewer than 3 distinct vertices")));
        }

        let mut mask = GrayImage::new(w, h);
        draw_polygon_mut(&mut mask, &local, Luma([255u8]));

        Ok(Self {
            idx,
            value: idx as i64,
            rectangle: (min_x, min_y, w, h),
            mask,
        })
    }

    /// Builds a rectangular ROI whose mask covers the whole rectangle.
    pub fn from_rect(idx: usize, x: i32, y: i32, w: u32, h: u32) -> Self {
        Self {
            idx,
            value: idx as i64,
            rectangle: (x, y, w, h),
            mask: GrayImage::from_pixel(w.max(1), h.max(1), Luma([255u8])),
        }
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn offset(&self) -> (i32, i32) {
        (self.rectangle.0, self.rectangle.1)
    }

    pub fn rectangle(&self) -> (i32, i32, u32, u32) {
        self.rectangle
    }

    pub fn longest_axis(&self) -> f64 {
        self.rectangle.2.max(self.rectangle.3) as f64
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Cuts the ROI out of a full frame. Returns the sub-frame and a mask of
    /// identical dimensions.
    pub fn apply(&self, frame: &GrayImage) -> Result<(GrayImage, GrayImage)> {
        let (x, y, w, h) = self.rectangle;
        let (img_w, img_h) = frame.dimensions();

        let x1 = x.max(0);
        let y1 = y.max(0);
        let x2 = (x + w as i32).min(img_w as i32);
        let y2 = (y + h as i32).min(img_h as i32);

        if x2 <= x1 || y2 <= y1 {
            return Err(Error::Setup(format!(
                "ROI {} at ({x}, {y}, {w}, {h}) does not overlap a {img_w}x{img_h} frame",
                self.idx
            )));
        }

        let (cw, ch) = ((x2 - x1) as u32, (y2 - y1) as u32);
        let sub = imageops::crop_imm(frame, x1 as u32, y1 as u32, cw, ch).to_image();

        // Whatever was clipped on the left/top shifts the mask window.
        let (mx, my) = ((x1 - x) as u32, (y1 - y) as u32);
        let mask = if mx + cw <= self.mask.width() && my + ch <= self.mask.height() {
            imageops::crop_imm(&self.mask, mx, my, cw, ch).to_image()
        } else {
            GrayImage::from_pixel(cw, ch, Luma([255u8]))
        };

        Ok((sub, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x + y) % 256) as u8]))
    }

    #[test]
    fn rectangle_roi_crops_its_window() {
        let roi = Roi::from_rect(3, 10, 20, 30, 15);
        let frame = gradient(100, 100);

        let (sub, mask) = roi.apply(&frame).unwrap();

        assert_eq!(sub.dimensions(), (30, 15));
        assert_eq!(mask.dimensions(), (30, 15));
        assert_eq!(sub.get_pixel(0, 0)[0], 30);
        assert!(mask.pixels().all(|p| p[0] == 255));
        assert_eq!(roi.offset(), (10, 20));
        assert_eq!(roi.longest_axis(), 30.0);
    }

    #[test]
    fn polygon_roi_masks_outside_pixels() {
        let roi = Roi::from_polygon(0, &[(0, 0), (20, 0), (0, 20)]).unwrap();
        assert_eq!(roi.rectangle(), (0, 0, 21, 21));
        assert_eq!(roi.mask().get_pixel(1, 1)[0], 255);
        assert_eq!(roi.mask().get_pixel(19, 19)[0], 0);
    }

    #[test]
    fn crop_is_clamped_to_the_frame() {
        let roi = Roi::from_rect(1, -5, 90, 20, 20);
        let (sub, mask) = roi.apply(&gradient(100, 100)).unwrap();
        assert_eq!(sub.dimensions(), (15, 10));
        assert_eq!(mask.dimensions(), sub.dimensions());
    }

    #[test]
    fn roi_outside_the_frame_is_a_setup_error() {
        let roi = Roi::from_rect(2, 200, 200, 10, 10);
        let err = roi.apply(&gradient(100, 100)).unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        assert!(Roi::from_polygon(0, &[(0, 0), (3, 3)]).is_err());
        let collapsed = Roi::from_polygon(0, &[(0, 0), (5, 5), (5, 5), (0, 0)]).unwrap_err();
        assert!(matches!(collapsed, Error::Setup(_)));
    }

    #[test]
    fn repeated_and_closing_vertices_are_tolerated() {
        let roi = Roi::from_polygon(0, &[(0, 0), (10, 0), (10, 0), (10, 10), (0, 0), (0, 0)]).unwrap();
        assert_eq!(roi.rectangle(), (0, 0, 11, 11));
        assert_eq!(roi.mask().get_pixel(8, 3)[0], 255);
        assert_eq!(roi.mask().get_pixel(2, 8)[0], 0);
    }
}
