// THEORY:
// ROIs are independent, so a frame can be tracked in every ROI at once. The
// `TrackerPool` does this without ever sharing tracker state:
//
// 1.  **Confinement**: every `TrackingUnit` is moved into its own worker task at
//     construction and never leaves it until `shutdown`. A worker receives frames
//     over its own channel and tracks them strictly in the order they arrive, so
//     each tracker still sees increasing timestamps.
// 2.  **Shared Frames**: a frame is read-only once captured, so it is fanned out
//     as an `Arc<GrayImage>` instead of being copied per ROI.
// 3.  **Bounded CPU**: tracking is synchronous, CPU-bound work. It runs on the
//     blocking thread pool, and a semaphore sized to the number of cores keeps the
//     number of ROIs being tracked at the same time in check.
// 4.  **Ordered Results**: the caller gets one entry per ROI, in the order the
//     units were given, each with that ROI's own `Result`. A setup error in one ROI
//     does not hide the others; a broken worker is an `Error::Pool`.

use crate::core_modules::data_point::DataPoint;
use crate::error::{Error, Result};
use crate::tracking_unit::TrackingUnit;
use futures::future::join_all;
use image::GrayImage;
use log::warn;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;

/// What one ROI produced for one frame.
#[derive(Debug)]
pub struct RoiOutput {
    pub roi_idx: usize,
    pub result: Result<Vec<DataPoint>>,
}

struct TrackTask {
    t: i64,
    frame: Arc<GrayImage>,
    result_sender: oneshot::Sender<Result<Vec<DataPoint>>>,
}

struct Worker {
    roi_idx: usize,
    task_sender: mpsc::UnboundedSender<TrackTask>,
    handle: JoinHandle<Option<TrackingUnit>>,
}

pub struct TrackerPool {
    workers: Vec<Worker>,
}

impl TrackerPool {
    /// Spawns one worker per unit, allowing as many concurrent trackers as cores.
    /// Must be called from within a tokio runtime.
    pub fn new(units: Vec<TrackingUnit>) -> Self {
        Self::with_concurrency(units, num_cpus::get())
    }

    pub fn with_concurrency(units: Vec<TrackingUnit>, max_concurrent: usize) -> Self {
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let workers = units
            .into_iter()
            .map(|unit| {
                let roi_idx = unit.roi().idx();
                let (task_sender, task_receiver) = mpsc::unbounded_channel::<TrackTask>();
                let handle = tokio::spawn(Self::run_worker(unit, task_receiver, Arc::clone(&permits)));
                Worker {
                    roi_idx,
                    task_sender,
                    handle,
                }
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn roi_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.workers.iter().map(|w| w.roi_idx)
    }

    async fn run_worker(
        mut unit: TrackingUnit,
        mut task_receiver: mpsc::UnboundedReceiver<TrackTask>,
        permits: Arc<Semaphore>,
    ) -> Option<TrackingUnit> {
        while let Some(task) = task_receiver.recv().await {
            let Ok(_permit) = permits.acquire().await else {
                return Some(unit);
            };
            let TrackTask {
                t,
                frame,
                result_sender,
            } = task;

            let joined = tokio::task::spawn_blocking(move || {
                let result = unit.track(t, &frame);
                (unit, result)
            })
            .await;

            match joined {
                Ok((returned, result)) => {
                    unit = returned;
                    let _ = result_sender.send(result);
                }
                Err(e) => {
                    warn!("Tracking worker failed: {e}");
                    let _ = result_sender.send(Err(Error::Pool(e.to_string())));
                    return None;
                }
            }
        }
        Some(unit)
    }

    /// Tracks `frame` at time `t` (ms) in every ROI and returns the outputs in
    /// unit order.
    pub async fn track(&self, t: i64, frame: Arc<GrayImage>) -> Result<Vec<RoiOutput>> {
        let mut pending = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let (result_sender, result_receiver) = oneshot::channel();
            worker
                .task_sender
                .send(TrackTask {
                    t,
                    frame: Arc::clone(&frame),
                    result_sender,
                })
                .map_err(|_| Error::Pool(format!("worker for ROI {} has stopped", worker.roi_idx)))?;
            pending.push((worker.roi_idx, result_receiver));
        }

        let (indices, receivers): (Vec<usize>, Vec<_>) = pending.into_iter().unzip();
        join_all(receivers)
            .await
            .into_iter()
            .zip(indices)
            .map(|(received, roi_idx)| {
                let result = received
                    .map_err(|_| Error::Pool(format!("worker for ROI {roi_idx} dropped its result")))?;
                Ok(RoiOutput { roi_idx, result })
            })
            .collect()
    }

    /// Stops every worker once its queued frames are tracked and hands the units
    /// back, in order.
    pub async fn shutdown(self) -> Result<Vec<TrackingUnit>> {
        let mut units = Vec::with_capacity(self.workers.len());
        for Worker {
            roi_idx,
            task_sender,
            handle,
        } in self.workers
        {
            drop(task_sender);
            let unit = handle
                .await
                .map_err(|e| Error::Pool(e.to_string()))?
                .ok_or_else(|| Error::Pool(format!("worker for ROI {roi_idx} lost its tracker")))?;
            units.push(unit);
        }
        Ok(units)
    }
}
