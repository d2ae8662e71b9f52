//! Worker pool dispatching
//!
//! Fans tiles out to a bounded pool of worker threads around a single
//! inference executor that owns the model. The executor collects tensors
//! into batches and runs them when the batch fills or a fill timeout
//! expires, so one accelerator is shared by many CPU-side workers. Bounded
//! channels cap in-flight pixels and unconsumed results, which bounds peak
//! memory on slides with tens of thousands of tiles.
//!
//! Completion order is unspecified; every outcome carries its tile so the
//! stitcher can regroup deterministically.

use crate::error::{PipelineError, Result};
use crate::model::{CellClassifier, SegmentationModel, SegmentationOutput};
use crate::reader::SlideReader;
use crate::types::{ProcessingLog, RawDetection, Tile};
use crate::worker::PatchWorker;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ndarray::{Array4, Axis};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long the executor waits for a batch to fill before running a partial
/// batch
const BATCH_FILL_TIMEOUT: Duration = Duration::from_millis(50);

/// Worker pool sizing and limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Parallel worker threads
    pub workers: usize,
    /// Upper bound on queued tiles and unconsumed results
    pub max_in_flight: usize,
    /// Tiles per model forward pass
    pub batch_size: usize,
    /// Wall-clock budget per tile attempt
    pub tile_timeout: Duration,
}

/// Shared cancellation handle.
///
/// Setting the flag aborts feeding and makes workers drain without
/// processing; an aborted slide yields an error, never a partial result.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct TileTask {
    tile: Tile,
    pixels: image::RgbImage,
}

struct InferRequest {
    tensor: Array4<f32>,
    response: Sender<Result<SegmentationOutput>>,
}

struct TileOutcome {
    tile: Tile,
    detections: Vec<RawDetection>,
    failure: Option<String>,
    retried: bool,
}

/// Run all tiles of one slide through the worker pool.
///
/// Returns per-tile detections (in completion order) together with the
/// slide's processing log. Failed tiles appear with zero detections and a
/// log entry; they never abort the slide.
pub fn run_tiles(
    reader: &mut dyn SlideReader,
    tiles: &[Tile],
    worker: &PatchWorker,
    model: &mut Box<dyn SegmentationModel>,
    classifier: Option<&Mutex<Box<dyn CellClassifier>>>,
    pool: &PoolConfig,
    cancel: &CancelFlag,
) -> Result<(Vec<(Tile, Vec<RawDetection>)>, ProcessingLog)> {
    let (task_tx, task_rx) = bounded::<TileTask>(pool.max_in_flight);
    let (infer_tx, infer_rx) = bounded::<InferRequest>(pool.max_in_flight);
    let (result_tx, result_rx) = bounded::<TileOutcome>(pool.max_in_flight);

    let workers = pool.workers.max(1);
    let batch_size = pool.batch_size.max(1);
    let tile_timeout = pool.tile_timeout;

    let outcome = crossbeam::thread::scope(|s| -> Result<(Vec<TileOutcome>, usize)> {
        let feeder = s.spawn(move |_| -> Result<()> {
            for tile in tiles {
                if cancel.is_cancelled() {
                    break;
                }
                let pixels = reader.read_region(tile.x, tile.y, tile.size, tile.size)?;
                if task_tx.send(TileTask { tile: *tile, pixels }).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let executor = s.spawn(move |_| {
            executor_loop(model.as_mut(), infer_rx, batch_size);
        });

        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let infer_tx = infer_tx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move |_| {
                worker_loop(
                    worker,
                    classifier,
                    task_rx,
                    infer_tx,
                    result_tx,
                    tile_timeout,
                    cancel,
                );
            });
        }
        // close our copies so channel disconnects propagate
        drop(task_rx);
        drop(infer_tx);
        drop(result_tx);

        let mut outcomes = Vec::with_capacity(tiles.len());
        for outcome in result_rx.iter() {
            outcomes.push(outcome);
        }

        feeder
            .join()
            .map_err(|_| PipelineError::pool("tile feeder panicked"))??;
        executor
            .join()
            .map_err(|_| PipelineError::pool("inference executor panicked"))?;

        Ok((outcomes, tiles.len()))
    })
    .map_err(|_| PipelineError::pool("worker pool panicked"))??;

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let (outcomes, tiles_total) = outcome;
    let mut log = ProcessingLog::new(tiles_total);
    let mut results = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        if outcome.retried {
            log.retries += 1;
        }
        if let Some(reason) = outcome.failure {
            log.record_failure(&outcome.tile, reason);
            results.push((outcome.tile, Vec::new()));
        } else {
            results.push((outcome.tile, outcome.detections));
        }
    }
    Ok((results, log))
}

fn worker_loop(
    worker: &PatchWorker,
    classifier: Option<&Mutex<Box<dyn CellClassifier>>>,
    task_rx: Receiver<TileTask>,
    infer_tx: Sender<InferRequest>,
    result_tx: Sender<TileOutcome>,
    tile_timeout: Duration,
    cancel: &CancelFlag,
) {
    for task in task_rx.iter() {
        if cancel.is_cancelled() {
            break;
        }

        let mut retried = false;
        let mut attempt = process_tile(worker, classifier, &task, &infer_tx, tile_timeout);
        if let Err(e) = &attempt {
            log::warn!(
                "tile {} at ({}, {}) failed, retrying once: {}",
                task.tile.index,
                task.tile.x,
                task.tile.y,
                e
            );
            retried = true;
            attempt = process_tile(worker, classifier, &task, &infer_tx, tile_timeout);
        }

        let outcome = match attempt {
            Ok(detections) => TileOutcome {
                tile: task.tile,
                detections,
                failure: None,
                retried,
            },
            Err(e) => {
                log::warn!(
                    "tile {} at ({}, {}) degraded to zero detections: {}",
                    task.tile.index,
                    task.tile.x,
                    task.tile.y,
                    e
                );
                TileOutcome {
                    tile: task.tile,
                    detections: Vec::new(),
                    failure: Some(e.to_string()),
                    retried,
                }
            }
        };

        if result_tx.send(outcome).is_err() {
            break;
        }
    }
}

/// One attempt at a tile: preprocess, submit to the executor, postprocess
fn process_tile(
    worker: &PatchWorker,
    classifier: Option<&Mutex<Box<dyn CellClassifier>>>,
    task: &TileTask,
    infer_tx: &Sender<InferRequest>,
    tile_timeout: Duration,
) -> Result<Vec<RawDetection>> {
    let tile = &task.tile;
    let wrap = |reason: String| PipelineError::TileInference {
        index: tile.index,
        x: tile.x,
        y: tile.y,
        reason,
    };

    let tensor = worker.prepare(&task.pixels).map_err(|e| wrap(e.to_string()))?;

    let (response_tx, response_rx) = bounded(1);
    infer_tx
        .send(InferRequest {
            tensor,
            response: response_tx,
        })
        .map_err(|_| wrap("inference executor unavailable".into()))?;

    let output = match response_rx.recv_timeout(tile_timeout) {
        Ok(result) => result.map_err(|e| wrap(e.to_string()))?,
        Err(RecvTimeoutError::Timeout) => {
            return Err(wrap(format!(
                "inference exceeded the {:?} tile budget",
                tile_timeout
            )));
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(wrap("inference executor shut down".into()));
        }
    };

    worker
        .detections_from_output(&output, classifier)
        .map_err(|e| wrap(e.to_string()))
}

/// Executor loop: collect requests into batches, run on fill or timeout.
fn executor_loop(
    model: &mut dyn SegmentationModel,
    infer_rx: Receiver<InferRequest>,
    batch_size: usize,
) {
    let mut batch: Vec<InferRequest> = Vec::with_capacity(batch_size);
    let mut batch_start: Option<Instant> = None;

    loop {
        let timeout = batch_start.map(|started| {
            BATCH_FILL_TIMEOUT
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::ZERO)
        });

        let request = match timeout {
            Some(timeout) => infer_rx.recv_timeout(timeout),
            None => infer_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match request {
            Ok(request) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }
                batch.push(request);
                if batch.len() >= batch_size {
                    execute_batch(model, &mut batch);
                    batch_start = None;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                execute_batch(model, &mut batch);
                batch_start = None;
            }
            Err(RecvTimeoutError::Disconnected) => {
                execute_batch(model, &mut batch);
                break;
            }
        }
    }
}

fn execute_batch(model: &mut dyn SegmentationModel, batch: &mut Vec<InferRequest>) {
    if batch.is_empty() {
        return;
    }

    let started = Instant::now();
    let batch_len = batch.len();

    let views: Vec<_> = batch.iter().map(|r| r.tensor.view()).collect();
    let input = match ndarray::concatenate(Axis(0), &views) {
        Ok(input) => input,
        Err(e) => {
            let reason = format!("failed to assemble batch: {}", e);
            for request in batch.drain(..) {
                let _ = request.response.send(Err(PipelineError::inference(reason.clone())));
            }
            return;
        }
    };

    match model.forward(&input) {
        Ok(outputs) if outputs.len() == batch_len => {
            log::debug!(
                "batch of {} tiles in {:.1} ms",
                batch_len,
                started.elapsed().as_secs_f32() * 1000.0
            );
            for (request, output) in batch.drain(..).zip(outputs) {
                let _ = request.response.send(Ok(output));
            }
        }
        Ok(outputs) => {
            let reason = format!(
                "model returned {} outputs for a batch of {}",
                outputs.len(),
                batch_len
            );
            for request in batch.drain(..) {
                let _ = request.response.send(Err(PipelineError::inference(reason.clone())));
            }
        }
        Err(e) => {
            let reason = e.to_string();
            for request in batch.drain(..) {
                let _ = request.response.send(Err(PipelineError::inference(reason.clone())));
            }
        }
    }
}
