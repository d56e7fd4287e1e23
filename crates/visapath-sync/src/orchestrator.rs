//! Batch Orchestrator: fixed-size batches, bounded concurrency, per-batch failure isolation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future, stream, StreamExt};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use visapath_core::{CanonicalRecord, Normalized};
use visapath_storage::StoreError;

const PROGRESS_EVERY: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub written: usize,
    pub matched: usize,
}

/// Writes one batch as a single store transaction.
#[async_trait]
pub trait BatchSink: Send + Sync {
    fn label(&self) -> &'static str;

    async fn write_batch(&self, batch: &[CanonicalRecord]) -> Result<BatchOutcome, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    /// Input positions covered by the batch, end exclusive.
    pub range_start: usize,
    pub range_end: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_seen: usize,
    pub records_skipped: usize,
    pub records_written: usize,
    pub records_matched: usize,
    /// Batches handed to the sink.
    pub batches_total: usize,
    pub batches_failed: usize,
    pub failures: Vec<BatchFailure>,
    pub cancelled: bool,
    /// Set when a store error made further batches pointless and the run stopped early.
    pub aborted: Option<String>,
}

struct Batch {
    index: usize,
    range_start: usize,
    range_end: usize,
    records: Vec<CanonicalRecord>,
}

/// Pulls normalized records into batches on demand, counting what it consumed.
struct Batcher<I> {
    records: std::iter::Enumerate<I>,
    batch_size: usize,
    built: usize,
    seen: usize,
    skipped: usize,
}

impl<I: Iterator<Item = Normalized>> Batcher<I> {
    fn new(records: I, batch_size: usize) -> Self {
        Self {
            records: records.enumerate(),
            batch_size,
            built: 0,
            seen: 0,
            skipped: 0,
        }
    }
}

impl<I: Iterator<Item = Normalized>> Iterator for Batcher<I> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let index = self.built;
        let batch_size = self.batch_size;
        let mut batch: Option<Batch> = None;
        for (position, item) in self.records.by_ref() {
            self.seen += 1;
            let record = match item {
                Normalized::Record(record) => record,
                Normalized::Skip(reason) => {
                    self.skipped += 1;
                    warn!(position, %reason, "skipping record");
                    continue;
                }
            };
            let current = batch.get_or_insert_with(|| Batch {
                index,
                range_start: position,
                range_end: position,
                records: Vec::with_capacity(batch_size),
            });
            current.range_end = position + 1;
            current.records.push(record);
            if current.records.len() >= batch_size {
                break;
            }
        }
        if batch.is_some() {
            self.built += 1;
        }
        batch
    }
}

pub struct BatchOrchestrator {
    batch_size: usize,
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl BatchOrchestrator {
    pub fn new(batch_size: usize, workers: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned cancel flag (the CLI's Ctrl-C handler sets it).
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Batches are cut lazily from `records`, so input is only read as fast as batches
    /// are scheduled. A connectivity or configuration error stops scheduling; batches
    /// already in flight still finish.
    pub async fn run<I>(&self, records: I, sink: &dyn BatchSink) -> RunSummary
    where
        I: IntoIterator<Item = Normalized>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("batch_run", %run_id, sink = sink.label());

        async move {
            info!(
                batch_size = self.batch_size,
                workers = self.workers,
                "starting batch run"
            );

            let mut batcher = Batcher::new(records.into_iter(), self.batch_size);
            let cancel = &self.cancel;
            let abort = AtomicBool::new(false);
            let abort_ref = &abort;
            let mut scheduled = 0usize;
            let scheduled_ref = &mut scheduled;
            let mut results = stream::iter(&mut batcher)
                .take_while(move |_| {
                    future::ready(
                        !cancel.load(Ordering::SeqCst) && !abort_ref.load(Ordering::SeqCst),
                    )
                })
                .map(move |batch| {
                    *scheduled_ref += 1;
                    async move {
                        let outcome = sink.write_batch(&batch.records).await;
                        (batch.index, batch.range_start, batch.range_end, outcome)
                    }
                })
                .buffer_unordered(self.workers);

            let mut records_written = 0usize;
            let mut records_matched = 0usize;
            let mut batches_done = 0usize;
            let mut failures = Vec::new();
            let mut aborted = None;
            let mut next_progress = PROGRESS_EVERY;

            while let Some((batch_index, range_start, range_end, outcome)) = results.next().await {
                batches_done += 1;
                match outcome {
                    Ok(outcome) => {
                        records_written += outcome.written;
                        records_matched += outcome.matched;
                        while records_written >= next_progress {
                            info!(records_written, batches_done, "progress");
                            next_progress += PROGRESS_EVERY;
                        }
                    }
                    Err(err) => {
                        if err.is_fatal_for_run() {
                            error!(
                                batch_index,
                                range_start,
                                range_end,
                                error = %err,
                                "store unusable, no further batches will be scheduled"
                            );
                            abort.store(true, Ordering::SeqCst);
                            aborted.get_or_insert_with(|| err.to_string());
                        } else {
                            error!(
                                batch_index,
                                range_start,
                                range_end,
                                error = %err,
                                "batch failed, continuing with the next one"
                            );
                        }
                        failures.push(BatchFailure {
                            batch_index,
                            range_start,
                            range_end,
                            error: err.to_string(),
                        });
                    }
                }
            }
            drop(results);
            failures.sort_by_key(|f| f.batch_index);

            let stopped_early = scheduled < batcher.built;
            let cancelled = stopped_early && aborted.is_none();
            if cancelled {
                warn!(
                    batches_run = scheduled,
                    "run cancelled before all batches were scheduled"
                );
            }

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                records_seen: batcher.seen,
                records_skipped: batcher.skipped,
                records_written,
                records_matched,
                batches_total: scheduled,
                batches_failed: failures.len(),
                failures,
                cancelled,
                aborted,
            };
            info!(
                records_seen = summary.records_seen,
                records_skipped = summary.records_skipped,
                records_written = summary.records_written,
                records_matched = summary.records_matched,
                batches_total = summary.batches_total,
                batches_failed = summary.batches_failed,
                cancelled = summary.cancelled,
                aborted = summary.aborted.is_some(),
                "batch run finished"
            );
            summary
        }
        .instrument(span)
        .await
    }
}
