// This file is an example of how to use the `ethotrack` library.
// The library entry point is `src/lib.rs`.
//
// It renders a synthetic arena with two regions: one fly walking in a circle on
// the left, two flies pacing back and forth on the right. Each region gets its
// own tracker and the pool tracks both regions of every frame concurrently.

use ethotrack::{Roi, TrackerKind, TrackerPool, TrackingUnit, VariableKind};
use image::{GrayImage, Luma};
use serde_json::json;
use std::sync::Arc;

const WIDTH: u32 = 200;
const HEIGHT: u32 = 100;
const FRAME_INTERVAL_MS: i64 = 40;

/// Dark 9x3 flies on a bright arena, given their centres.
fn render(flies: &[(f64, f64)]) -> GrayImage {
    GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let inside = flies
            .iter()
            .any(|&(cx, cy)| (x as f64 - cx).abs() <= 4.0 && (y as f64 - cy).abs() <= 1.0);
        Luma([if inside { 25 } else { 190 }])
    })
}

fn flies_at(frame_idx: usize) -> Vec<(f64, f64)> {
    if frame_idx == 0 {
        return Vec::new();
    }
    let phase = frame_idx as f64 * 0.1;
    let pace = (frame_idx as f64 * 0.5) % 20.0;
    vec![
        (50.0 + 20.0 * phase.cos(), 50.0 + 20.0 * phase.sin()),
        (125.0 + pace, 25.0),
        (175.0 - pace, 75.0),
    ]
}

#[tokio::main]
async fn main() -> ethotrack::Result<()> {
    println!("ethotrack - Example Runner");

    let units = vec![
        TrackingUnit::new(
            TrackerKind::AdaptiveBg,
            Roi::from_rect(0, 0, 0, 100, HEIGHT),
            &json!({ "max_m_log_lik": 1e9 }),
        )?,
        TrackingUnit::new(
            TrackerKind::MultiFlyIds,
            Roi::from_rect(1, 100, 0, 100, HEIGHT),
            &json!({ "n_objects": 2, "settle_frames": 3 }),
        )?,
    ];
    let pool = TrackerPool::new(units);

    for frame_idx in 0..20 {
        let t = frame_idx as i64 * FRAME_INTERVAL_MS;
        let frame = Arc::new(render(&flies_at(frame_idx)));

        for output in pool.track(t, frame).await? {
            match output.result {
                Ok(points) if points.is_empty() => {
                    println!("t={t:>4} ms  ROI {}: no detection", output.roi_idx)
                }
                Ok(points) => {
                    for p in points {
                        let described: Vec<String> = p
                            .values()
                            .map(|v| format!("{}={}", v.header_name(), v.value()))
                            .collect();
                        println!("t={t:>4} ms  ROI {}: {}", output.roi_idx, described.join(" "));
                    }
                }
                Err(e) => println!("t={t:>4} ms  ROI {}: {e}", output.roi_idx),
            }
        }
    }

    for unit in pool.shutdown().await? {
        if let Some(last) = unit.last_positions(true) {
            let centres: Vec<(i64, i64)> = last
                .iter()
                .filter_map(|p| Some((p.value_of(VariableKind::X)?, p.value_of(VariableKind::Y)?)))
                .collect();
            println!("ROI {} last seen at {:?} (frame coordinates)", unit.roi().idx(), centres);
        }
    }
    Ok(())
}
