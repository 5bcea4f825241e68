use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, StageError};

/// Tolerance for comparing a success rate against its threshold.
const RATE_EPSILON: f64 = 1e-9;

/// One failed work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub item_key: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Per-stage tally. `succeeded + failed == total` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batches: usize,
    pub min_success_rate: f64,
    pub passed: bool,
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    pub fn new(min_success_rate: f64) -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            batches: 0,
            min_success_rate,
            passed: true,
            failures: Vec::new(),
        }
    }

    /// Empty input counts as fully successful.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    pub fn meets_threshold(&self) -> bool {
        self.success_rate() + RATE_EPSILON >= self.min_success_rate
    }

    pub fn record_success(&mut self) {
        self.total += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, item_key: String, error_kind: ErrorKind, message: String) {
        self.total += 1;
        self.failed += 1;
        self.failures.push(ItemFailure {
            item_key,
            error_kind,
            message,
        });
    }

    /// Recompute `passed` from the current counts.
    pub fn seal(&mut self) {
        self.passed = self.meets_threshold();
    }
}

/// Runs work items in fixed-size batches and gates on success rate.
///
/// All items of batch N are attempted before batch N+1 starts. Within a
/// batch at most `max_in_flight` stage futures are polled at once, on the
/// caller's task; output order follows input order.
#[derive(Clone)]
pub struct BatchRunner {
    batch_size: usize,
    min_success_rate: f64,
    max_in_flight: usize,
    batch_delay: Duration,
    progress: Option<ProgressBar>,
}

impl BatchRunner {
    pub fn new(batch_size: usize, min_success_rate: f64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            min_success_rate: min_success_rate.clamp(0.0, 1.0),
            max_in_flight: 1,
            batch_delay: Duration::ZERO,
            progress: None,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_batch_delay(mut self, batch_delay: Duration) -> Self {
        self.batch_delay = batch_delay;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn batch_count(&self, items: usize) -> usize {
        items.div_ceil(self.batch_size)
    }

    /// Run `stage_fn` over every item; failures are recorded, never raised.
    pub async fn run<'a, I, O, K, F, Fut>(
        &self,
        stage: &str,
        items: &'a [I],
        key: K,
        stage_fn: F,
    ) -> (Vec<O>, BatchOutcome)
    where
        K: Fn(&I) -> String,
        F: Fn(&'a I) -> Fut,
        Fut: Future<Output = Result<O, StageError>>,
    {
        self.run_each_batch(stage, items, key, stage_fn, |_, _| {}).await
    }

    /// Like [`run`](Self::run), handing each batch's successful outputs to
    /// `on_batch` (with the 1-based batch number) as soon as it completes.
    pub async fn run_each_batch<'a, I, O, K, F, Fut, B>(
        &self,
        stage: &str,
        items: &'a [I],
        key: K,
        stage_fn: F,
        mut on_batch: B,
    ) -> (Vec<O>, BatchOutcome)
    where
        K: Fn(&I) -> String,
        F: Fn(&'a I) -> Fut,
        Fut: Future<Output = Result<O, StageError>>,
        B: FnMut(usize, &[O]),
    {
        let mut outputs = Vec::with_capacity(items.len());
        let mut outcome = BatchOutcome::new(self.min_success_rate);
        let total_batches = self.batch_count(items.len());

        for (index, batch) in items.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            debug!(stage, batch = index + 1, total_batches, size = batch.len(), "starting batch");

            let first_output = outputs.len();
            let results: Vec<(&'a I, Result<O, StageError>)> = stream::iter(batch)
                .map(|item| {
                    let fut = stage_fn(item);
                    async move { (item, fut.await) }
                })
                .buffered(self.max_in_flight)
                .collect()
                .await;

            for (item, result) in results {
                match result {
                    Ok(output) => {
                        outputs.push(output);
                        outcome.record_success();
                    }
                    Err(err) => {
                        let item_key = key(item);
                        warn!(stage, item = %item_key, kind = %err.kind(), error = %err, "item failed");
                        outcome.record_failure(item_key, err.kind(), err.to_string());
                    }
                }
                if let Some(pb) = &self.progress {
                    pb.inc(1);
                }
            }
            outcome.batches += 1;
            on_batch(index + 1, &outputs[first_output..]);
        }

        outcome.seal();
        info!(
            stage,
            total = outcome.total,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            success_rate = outcome.success_rate(),
            passed = outcome.passed,
            "stage finished"
        );
        (outputs, outcome)
    }
}
