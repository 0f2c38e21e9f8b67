// End-to-end behaviour of the trackers on full synthetic frames: seeding,
// orientation, degenerate detections, foreground health and the tracker
// contract seen through `TrackingUnit`.

use ethotrack::core_modules::contour::{Contour, RotatedRect};
use ethotrack::core_modules::preprocess::{PreprocessConfig, preprocess};
use ethotrack::core_modules::segmentation::ForegroundModelConfig;
use ethotrack::trackers::{
    AdaptiveBgConfig, AdaptiveBgTracker, IdentityTracker, IdentityTrackerConfig, MultiFlyConfig, MultiFlyTracker,
    PrecomputedBgConfig, PrecomputedBgTracker,
};
use ethotrack::{Error, NoPositionReason, Roi, Tracker, TrackerKind, TrackingUnit, VariableKind, build_tracker};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use std::sync::Arc;
use strum::IntoEnumIterator;

const SIZE: u32 = 80;
const ARENA: u8 = 170;
const FLY: u8 = 25;

fn arena() -> GrayImage {
    GrayImage::from_pixel(SIZE, SIZE, Luma([ARENA]))
}

/// A dark `len` x `thickness` bar centred at (`cx`, `cy`) and rotated by `degrees`.
fn with_bar(mut frame: GrayImage, cx: f64, cy: f64, len: f64, thickness: f64, degrees: f64) -> GrayImage {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    let poly: Vec<Point<i32>> = corners
        .iter()
        .map(|&(sx, sy)| {
            let (dx, dy) = (sx * len / 2.0, sy * thickness / 2.0);
            Point::new(
                (cx + dx * cos - dy * sin).round() as i32,
                (cy + dx * sin + dy * cos).round() as i32,
            )
        })
        .collect();
    draw_polygon_mut(&mut frame, &poly, Luma([FLY]));
    frame
}

fn full_mask() -> GrayImage {
    GrayImage::from_pixel(SIZE, SIZE, Luma([255]))
}

fn roi() -> Arc<Roi> {
    Arc::new(Roi::from_rect(0, 0, 0, SIZE, SIZE))
}

fn lenient_single() -> AdaptiveBgConfig {
    AdaptiveBgConfig {
        max_m_log_lik: f64::INFINITY,
        ..AdaptiveBgConfig::default()
    }
}

#[test]
fn the_first_frame_seeds_every_tracker() {
    let frame = with_bar(arena(), 40.0, 40.0, 10.0, 3.0, 30.0);

    let mut single = AdaptiveBgTracker::new(roi(), AdaptiveBgConfig::default());
    let err = single.find_position(&frame, &full_mask(), 0).unwrap_err();
    assert!(matches!(err, Error::NoPosition(NoPositionReason::Seeding)));
    let expected = preprocess(&frame, &full_mask(), &PreprocessConfig::default()).unwrap();
    assert_eq!(single.background().bg_img().unwrap(), expected);

    let mut multi = MultiFlyTracker::new(roi(), MultiFlyConfig::default());
    assert!(multi.find_position(&frame, &full_mask(), 0).unwrap_err().is_no_position());
    let lighting = PreprocessConfig {
        adaptive_lighting: true,
        ..PreprocessConfig::default()
    };
    assert_eq!(
        multi.background().bg_img().unwrap(),
        preprocess(&frame, &full_mask(), &lighting).unwrap()
    );

    let mut ids = IdentityTracker::new(roi(), IdentityTrackerConfig::default());
    assert!(ids.find_position(&frame, &full_mask(), 0).unwrap_err().is_no_position());
    assert_eq!(ids.background().bg_img().unwrap(), expected);

    for kind in TrackerKind::iter() {
        let mut tracker = build_tracker(kind, roi(), &serde_json::Value::Null).unwrap();
        assert!(tracker.track(0, &frame).unwrap().is_empty(), "{kind} reported on its seeding frame");
    }
}

#[test]
fn orientation_is_normalised_for_every_heading() {
    for step in 0..12 {
        let degrees = step as f64 * 15.0;
        let mut tracker = AdaptiveBgTracker::new(roi(), lenient_single());
        tracker.find_position(&arena(), &full_mask(), 0).unwrap_err();

        let frame = with_bar(arena(), 40.0, 40.0, 16.0, 4.0, degrees);
        let points = tracker.find_position(&frame, &full_mask(), 40).unwrap();

        let p = &points[0];
        let phi = p.value_of(VariableKind::Phi).unwrap();
        assert!((0..180).contains(&phi), "phi {phi} at {degrees} degrees");
        assert!(p.value_of(VariableKind::Width).unwrap() >= p.value_of(VariableKind::Height).unwrap());
        if step == 0 {
            assert!(phi <= 8 || phi >= 172, "horizontal bar gave phi {phi}");
        }
        if step == 6 {
            assert!((phi - 90).abs() <= 8, "vertical bar gave phi {phi}");
        }
    }
}

#[test]
fn normalisation_is_idempotent() {
    let contour = Contour::new(vec![
        Point::new(0, 0),
        Point::new(3, 9),
        Point::new(7, 8),
        Point::new(4, -1),
    ]);
    let once = contour.min_area_rect().normalized();
    assert_eq!(once.normalized(), once);

    let tall = RotatedRect::new((5.0, 5.0), (2.0, 10.0), -30.0).normalized();
    assert_eq!(tall.size, (10.0, 2.0));
    assert!((tall.angle - 60.0).abs() < 1e-9);
}

#[test]
fn detections_longer_than_twice_the_short_side_are_dropped() {
    const W: u32 = 100;
    const H: u32 = 12;
    let roi = Arc::new(Roi::from_rect(0, 0, 0, W, H));
    let mask = GrayImage::from_pixel(W, H, Luma([255]));
    let empty = GrayImage::from_pixel(W, H, Luma([ARENA]));
    let mut barred = empty.clone();
    for y in 5..8 {
        for x in 35..65 {
            barred.put_pixel(x, y, Luma([FLY]));
        }
    }

    let mut single = AdaptiveBgTracker::new(
        Arc::clone(&roi),
        AdaptiveBgConfig {
            object_expected_size: 0.2,
            ..lenient_single()
        },
    );
    single.find_position(&empty, &mask, 0).unwrap_err();
    let err = single.find_position(&barred, &mask, 40).unwrap_err();
    assert!(matches!(err, Error::NoPosition(NoPositionReason::Degenerate)));

    let mut multi = MultiFlyTracker::new(
        roi,
        MultiFlyConfig {
            foreground: ForegroundModelConfig {
                normal_limits: (10.0, 2000.0),
                ..ForegroundModelConfig::default()
            },
            ..MultiFlyConfig::default()
        },
    );
    multi.find_position(&empty, &mask, 0).unwrap_err();
    let err = multi.find_position(&barred, &mask, 40).unwrap_err();
    assert!(matches!(err, Error::NoPosition(NoPositionReason::NoValidContours)));
}

#[test]
fn an_unchanged_scene_never_slows_learning_down() {
    let mut tracker = AdaptiveBgTracker::new(roi(), lenient_single());
    tracker.find_position(&arena(), &full_mask(), 0).unwrap_err();

    // A few clean detections bring the rate down from its maximum.
    for (i, x) in [30.0, 33.0, 36.0].into_iter().enumerate() {
        let frame = with_bar(arena(), x, 40.0, 10.0, 3.0, 0.0);
        tracker.find_position(&frame, &full_mask(), 40 * (i as i64 + 1)).unwrap();
    }
    let before = tracker.background().learning_rate();
    assert!(before < tracker.config().learning_rate.max_learning_rate);

    let err = tracker.find_position(&arena(), &full_mask(), 400).unwrap_err();

    assert!(matches!(err, Error::NoPosition(NoPositionReason::NoForeground)));
    assert!(tracker.background().learning_rate() >= before);
}

#[test]
fn a_fixed_background_ignores_flooded_frames() {
    let mut tracker = PrecomputedBgTracker::new(roi(), PrecomputedBgConfig::default());
    tracker.compute_background(&[arena(), arena(), arena()]).unwrap();
    let before = tracker.background().unwrap().clone();

    let flooded = GrayImage::from_fn(SIZE, SIZE, |x, y| {
        let in_block = |v: u32| (v % 20) < 14;
        Luma([if in_block(x) && in_block(y) { 90 } else { ARENA }])
    });
    for t in 1..5 {
        assert!(tracker.track(t * 40, &flooded).unwrap().is_empty());
    }

    assert_eq!(tracker.background().unwrap(), &before);
}

#[test]
fn no_position_frames_reuse_the_last_detection_for_a_while() {
    let roi = Roi::from_rect(0, 10, 20, SIZE, SIZE);
    let mut unit = TrackingUnit::new(TrackerKind::AdaptiveBg, roi, &serde_json::json!({ "max_m_log_lik": 1e9 }))
        .unwrap();
    let frame_with = |fly: Option<(f64, f64)>| {
        let mut full = GrayImage::from_pixel(SIZE + 20, SIZE + 40, Luma([ARENA]));
        if let Some((x, y)) = fly {
            full = with_bar(full, x + 10.0, y + 20.0, 10.0, 3.0, 0.0);
        }
        full
    };

    assert!(unit.track(0, &frame_with(None)).unwrap().is_empty());
    let seen = unit.track(40, &frame_with(Some((40.0, 40.0)))).unwrap();
    assert_eq!(seen[0].value_of(VariableKind::IsInferred), Some(0));

    let inferred = unit.track(80, &frame_with(None)).unwrap();
    assert_eq!(inferred.len(), 1);
    assert_eq!(inferred[0].value_of(VariableKind::IsInferred), Some(1));
    assert_eq!(inferred[0].value_of(VariableKind::X), seen[0].value_of(VariableKind::X));

    // Out-of-order frames are ignored without touching the history.
    let len = unit.tracker().history().len();
    assert!(unit.track(60, &frame_with(Some((40.0, 40.0)))).unwrap().is_empty());
    assert_eq!(unit.tracker().history().len(), len);

    assert!(unit.track(40 + 31_000, &frame_with(None)).unwrap().is_empty());

    let absolute = unit.last_positions(true).unwrap();
    assert_eq!(
        absolute[0].value_of(VariableKind::X).unwrap(),
        seen[0].value_of(VariableKind::X).unwrap() + 10
    );
}
