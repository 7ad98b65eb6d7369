//! The batch scheduler: slices a job into batches and drives a bounded
//! worker pool over the rows of each batch.

use futures::{stream, StreamExt};
use metrics::{counter, describe_counter};
use serde::Serialize;
use std::cmp::max;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::cancel::CancelToken;
use crate::engine::{cancelled_result, Orchestrator, PriorAttempt, RunMode};
use crate::precision::Precision;
use crate::results::GeocodeResult;
use crate::rows::AddressRecord;

/// One unit of work: a row to geocode, plus its previous outcome when this
/// is a retry.
#[derive(Clone, Debug)]
pub struct RowTask {
    pub row_index: usize,
    pub record: AddressRecord,
    pub prior: Option<PriorAttempt>,
}

/// Per-job knobs.
#[derive(Clone, Copy, Debug)]
pub struct JobOptions {
    pub batch_size: usize,
    pub worker_count: usize,
    pub mode: RunMode,
}

/// Called with `delta = 1` after each row completes.
pub type ProgressSink = Arc<dyn Fn(usize) + Send + Sync>;

/// What one batch did.
#[derive(Clone, Debug, Serialize)]
pub struct BatchSummary {
    pub index: usize,
    pub size: usize,
    pub success_count: usize,
    pub precision_histogram: BTreeMap<Precision, usize>,
}

/// Everything a finished job hands back.
#[derive(Debug)]
pub struct JobOutput {
    /// One result per input row, in ascending `row_index` order.
    pub results: Vec<GeocodeResult>,
    pub batches: Vec<BatchSummary>,
    pub cancelled: bool,
}

/// Run one job: partition `tasks` into contiguous batches, geocode each
/// batch with bounded parallelism, and reassemble results by row index.
///
/// Worker failures never abort the batch; every row comes back as a
/// `GeocodeResult`, errors included. Cancellation stops new dispatch and
/// reports the skipped rows as cancelled errors.
#[instrument(level = "debug", skip_all, fields(rows = tasks.len()))]
pub async fn run_job(
    orchestrator: Arc<Orchestrator>,
    tasks: Vec<RowTask>,
    options: JobOptions,
    progress: Option<ProgressSink>,
    cancel: &CancelToken,
) -> JobOutput {
    describe_counter!("geofuse.rows.total", "Rows processed, by outcome");
    describe_counter!("geofuse.batches.total", "Batches processed");

    let batch_size = max(1, options.batch_size);
    let worker_count = max(1, options.worker_count);

    let mut results = Vec::with_capacity(tasks.len());
    let mut batches = vec![];

    let mut remaining = tasks.into_iter().peekable();
    let mut batch_index = 0;
    while remaining.peek().is_some() {
        let batch: Vec<RowTask> = remaining.by_ref().take(batch_size).collect();
        let batch_results =
            run_batch(&orchestrator, batch, options.mode, worker_count, &progress, cancel)
                .await;

        let summary = summarize_batch(batch_index, &batch_results);
        debug!(
            "batch {}: {}/{} rows OK",
            summary.index, summary.success_count, summary.size
        );
        counter!("geofuse.batches.total", 1);
        batches.push(summary);
        results.extend(batch_results);
        batch_index += 1;
    }

    // Completion order is arbitrary; the output order is not.
    results.sort_by_key(|result| result.row_index);

    JobOutput {
        results,
        batches,
        cancelled: cancel.is_cancelled(),
    }
}

/// Geocode every row of one batch, waiting for all of them before
/// returning, so per-batch statistics are exact.
async fn run_batch(
    orchestrator: &Arc<Orchestrator>,
    batch: Vec<RowTask>,
    mode: RunMode,
    worker_count: usize,
    progress: &Option<ProgressSink>,
    cancel: &CancelToken,
) -> Vec<GeocodeResult> {
    stream::iter(batch.into_iter().map(|task| {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        async move {
            let result = if cancel.is_cancelled() {
                // Not dispatched: report the row as cancelled.
                cancelled_result(task.row_index)
            } else {
                match &task.prior {
                    None => {
                        orchestrator
                            .geocode_row(task.row_index, &task.record, mode, &cancel)
                            .await
                    }
                    Some(prior) => {
                        orchestrator
                            .retry_row(task.row_index, &task.record, prior, mode, &cancel)
                            .await
                    }
                }
            };
            counter!("geofuse.rows.total", 1, "outcome" => result.status.to_string());
            if let Some(progress) = &progress {
                progress(1);
            }
            result
        }
    }))
    .buffer_unordered(worker_count)
    .collect()
    .await
}

fn summarize_batch(index: usize, results: &[GeocodeResult]) -> BatchSummary {
    let mut precision_histogram = BTreeMap::new();
    let mut success_count = 0;
    for result in results {
        if result.is_ok() {
            success_count += 1;
            if let Some(precision) = result.precision_level {
                *precision_histogram.entry(precision).or_insert(0) += 1;
            }
        }
    }
    BatchSummary {
        index,
        size: results.len(),
        success_count,
        precision_histogram,
    }
}
