// THEORY:
// A `Contour` is the outline polygon of one connected foreground region, in
// sub-frame pixel coordinates. Everything a tracker needs to know about a blob is
// derived from it here:
//
// 1.  **Measures**: enclosed area (shoelace formula) and perimeter.
// 2.  **Rasterisation**: the filled polygon as a binary mask, used for overlap
//     tests between frames and for pixel-accurate centroids.
// 3.  **Rotated rectangle**: the minimum-area enclosing rectangle, found with
//     rotating calipers over the convex hull. This is the shape descriptor every
//     tracker reports (centre, long side, short side, orientation).
// 4.  **Exclusion stamps**: a filled ellipse slightly larger than the rectangle,
//     painted into a mask so the animal's own pixels stay out of the background
//     average.
//
// Orientation is unsigned: a fly's long axis has no front, so the canonical angle
// lives in [0, 180) and the rectangle is always reported with width >= height.

use crate::core_modules::variables::Variable;
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometry::{arc_length, convex_hull};
use imageproc::point::Point;

/// Number of vertices used to approximate an ellipse stamp.
const ELLIPSE_VERTICES: usize = 36;

#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    points: Vec<Point<i32>>,
}

impl Contour {
    pub fn new(points: Vec<Point<i32>>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point<i32>] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Enclosed area of the closed polygon.
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let twice: i64 = (0..n)
            .map(|i| {
                let a = self.points[i];
                let b = self.points[(i + 1) % n];
                a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
            })
            .sum();
        twice.abs() as f64 / 2.0
    }

    pub fn perimeter(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        arc_length(&self.points, true)
    }

    /// Paints the filled polygon into `canvas`. Points outside the canvas are ignored.
    pub fn fill_into(&self, canvas: &mut GrayImage, value: u8) {
        let poly = open_polygon(&self.points);
        if poly.len() >= 3 {
            draw_polygon_mut(canvas, &poly, Luma([value]));
        }
        // The filler may leave thin outlines and degenerate shapes untouched.
        let (w, h) = canvas.dimensions();
        for p in &self.points {
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < w && (p.y as u32) < h {
                canvas.put_pixel(p.x as u32, p.y as u32, Luma([value]));
            }
        }
    }

    pub fn to_mask(&self, width: u32, height: u32) -> GrayImage {
        let mut mask = GrayImage::new(width, height);
        self.fill_into(&mut mask, 255);
        mask
    }

    /// Mean position of the filled region's pixels, falling back to the vertex mean
    /// when the region does not touch the canvas.
    pub fn centroid(&self, width: u32, height: u32) -> (f64, f64) {
        let mask = self.to_mask(width, height);
        pixel_centroid(&mask).unwrap_or_else(|| self.vertex_mean())
    }

    fn vertex_mean(&self) -> (f64, f64) {
        if self.points.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.points.len() as f64;
        let sx: f64 = self.points.iter().map(|p| p.x as f64).sum();
        let sy: f64 = self.points.iter().map(|p| p.y as f64).sum();
        (sx / n, sy / n)
    }

    /// Minimum-area enclosing rectangle, not yet normalised.
    pub fn min_area_rect(&self) -> RotatedRect {
        let hull: Vec<(f64, f64)> = convex_hull(&self.points[..])
            .into_iter()
            .map(|p| (p.x as f64, p.y as f64))
            .collect();

        match hull.len() {
            0 => RotatedRect::new((0.0, 0.0), (0.0, 0.0), 0.0),
            1 => RotatedRect::new(hull[0], (0.0, 0.0), 0.0),
            2 => {
                let (a, b) = (hull[0], hull[1]);
                let (dx, dy) = (b.0 - a.0, b.1 - a.1);
                RotatedRect::new(
                    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0),
                    (dx.hypot(dy), 0.0),
                    dy.atan2(dx).to_degrees(),
                )
            }
            n => {
                let mut best: Option<(f64, RotatedRect)> = None;
                for i in 0..n {
                    let (a, b) = (hull[i], hull[(i + 1) % n]);
                    let len = (b.0 - a.0).hypot(b.1 - a.1);
                    if len == 0.0 {
                        continue;
                    }
                    // Edge direction and its normal.
                    let u = ((b.0 - a.0) / len, (b.1 - a.1) / len);
                    let v = (-u.1, u.0);

                    let (mut min_u, mut max_u) = (f64::MAX, f64::MIN);
                    let (mut min_v, mut max_v) = (f64::MAX, f64::MIN);
                    for p in &hull {
                        let pu = p.0 * u.0 + p.1 * u.1;
                        let pv = p.0 * v.0 + p.1 * v.1;
                        min_u = min_u.min(pu);
                        max_u = max_u.max(pu);
                        min_v = min_v.min(pv);
                        max_v = max_v.max(pv);
                    }

                    let area = (max_u - min_u) * (max_v - min_v);
                    if best.as_ref().is_none_or(|(a, _)| area < *a) {
                        let cu = (min_u + max_u) / 2.0;
                        let cv = (min_v + max_v) / 2.0;
                        let center = (cu * u.0 + cv * v.0, cu * u.1 + cv * v.1);
                        let rect = RotatedRect::new(
                            center,
                            (max_u - min_u, max_v - min_v),
                            u.1.atan2(u.0).to_degrees(),
                        );
                        best = Some((area, rect));
                    }
                }
                best.map(|(_, r)| r)
                    .unwrap_or_else(|| RotatedRect::new(hull[0], (0.0, 0.0), 0.0))
            }
        }
    }
}

/// Mean coordinate of all non-zero pixels, `None` for an empty mask.
pub fn pixel_centroid(mask: &GrayImage) -> Option<(f64, f64)> {
    let (mut sx, mut sy, mut n) = (0.0, 0.0, 0u64);
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] > 0 {
            sx += x as f64;
            sy += y as f64;
            n += 1;
        }
    }
    (n > 0).then(|| (sx / n as f64, sy / n as f64))
}

/// Drops repeated vertices and closing points, which the polygon filler rejects.
pub(crate) fn open_polygon(points: &[Point<i32>]) -> Vec<Point<i32>> {
    let mut poly = points.to_vec();
    poly.dedup();
    while poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }
    poly
}

/// A rectangle of any orientation. `angle` is in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub center: (f64, f64),
    pub size: (f64, f64),
    pub angle: f64,
}

impl RotatedRect {
    pub fn new(center: (f64, f64), size: (f64, f64), angle: f64) -> Self {
        Self {
            center,
            size,
            angle,
        }
    }

    /// Puts the long side first and reduces the angle into [0, 180).
    /// Idempotent.
    pub fn normalized(self) -> Self {
        let (mut w, mut h) = self.size;
        let mut angle = self.angle;
        if w < h {
            std::mem::swap(&mut w, &mut h);
            angle -= 90.0;
        }
        let mut angle = angle.rem_euclid(180.0);
        // rem_euclid rounds tiny negatives up to the modulus itself.
        if angle >= 180.0 {
            angle = 0.0;
        }
        Self {
            center: self.center,
            size: (w, h),
            angle,
        }
    }

    /// Degenerate if either side is more than twice the shorter frame dimension.
    pub fn exceeds_frame(&self, frame_w: u32, frame_h: u32) -> bool {
        let limit = 2.0 * frame_w.min(frame_h) as f64;
        self.size.0 > limit || self.size.1 > limit
    }

    /// The angle as an integer in [0, 180).
    pub fn phi(&self) -> i64 {
        (self.angle.round() as i64).rem_euclid(180)
    }

    pub fn center_i64(&self) -> (i64, i64) {
        (self.center.0.round() as i64, self.center.1.round() as i64)
    }

    /// x, y, w, h, phi in emission order.
    pub fn to_variables(&self) -> [Variable; 5] {
        let (x, y) = self.center_i64();
        [
            Variable::x(x),
            Variable::y(y),
            Variable::width(self.size.0.round() as i64),
            Variable::height(self.size.1.round() as i64),
            Variable::phi(self.phi()),
        ]
    }

    /// Paints a filled ellipse inscribed in this rectangle scaled by `scale`.
    pub fn stamp_ellipse(&self, canvas: &mut GrayImage, scale: f64, value: u8) {
        let a = (self.size.0 * scale / 2.0).max(1.0);
        let b = (self.size.1 * scale / 2.0).max(1.0);
        let (sin, cos) = self.angle.to_radians().sin_cos();

        let mut poly: Vec<Point<i32>> = (0..ELLIPSE_VERTICES)
            .map(|i| {
                let t = i as f64 * std::f64::consts::TAU / ELLIPSE_VERTICES as f64;
                let (ex, ey) = (a * t.cos(), b * t.sin());
                Point::new(
                    (self.center.0 + ex * cos - ey * sin).round() as i32,
                    (self.center.1 + ex * sin + ey * cos).round() as i32,
                )
            })
            .collect();
        poly.dedup();
        while poly.len() > 1 && poly.first() == poly.last() {
            poly.pop();
        }

        if poly.len() >= 3 {
            draw_polygon_mut(canvas, &poly, Luma([value]));
        } else {
            let (cx, cy) = self.center_i64();
            let (w, h) = canvas.dimensions();
            if cx >= 0 && cy >= 0 && (cx as u32) < w && (cy as u32) < h {
                canvas.put_pixel(cx as u32, cy as u32, Luma([value]));
            }
        }
    }
}
