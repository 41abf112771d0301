//! Batch Processing Module
//!
//! Drives a source's record stream to full labeled coverage: partitions
//! records into batches, skips identities the progress store has already
//! committed, dispatches batches with bounded parallelism, and writes every
//! outcome durably before the result is surfaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::{Duration, Instant};

use crate::db_core::prelude::DatabaseConnection;
use crate::error::AppResult;
use crate::model::labels::Religion;
use crate::model::progress::ProgressCtrl;
use crate::model::voter::{VoterDetails, VoterRecord};
use crate::prompt::azure::CompletionApi;
use crate::prompt::classify::BatchClassifier;

/// Counters owned by one run, shared across in-flight batches.
#[derive(Clone)]
pub struct RunStats {
    total_processed: Arc<AtomicU64>,
    successful: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    started_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct RunStatsSnapshot {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub elapsed: Duration,
    pub records_per_min: f64,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            total_processed: Arc::new(AtomicU64::new(0)),
            successful: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    fn add_successful(&self, count: u64) {
        self.successful.fetch_add(count, Relaxed);
        self.total_processed.fetch_add(count, Relaxed);
    }

    fn add_failed(&self, count: u64) {
        self.failed.fetch_add(count, Relaxed);
        self.total_processed.fetch_add(count, Relaxed);
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        let elapsed = self.started_at.elapsed();
        let total_processed = self.total_processed.load(Relaxed);
        let minutes = elapsed.as_secs_f64() / 60.0;
        let records_per_min = if minutes > 0.0 {
            total_processed as f64 / minutes
        } else {
            0.0
        };

        RunStatsSnapshot {
            total_processed,
            successful: self.successful.load(Relaxed),
            failed: self.failed.load(Relaxed),
            elapsed,
            records_per_min,
        }
    }
}

pub struct BatchProcessor<A> {
    conn: DatabaseConnection,
    classifier: BatchClassifier<A>,
    batch_size: usize,
    max_parallel: usize,
    batch_delay: Duration,
    stats: RunStats,
}

impl<A: CompletionApi> BatchProcessor<A> {
    pub fn new(
        conn: DatabaseConnection,
        classifier: BatchClassifier<A>,
        batch_size: usize,
        max_parallel: usize,
        batch_delay: Duration,
    ) -> Self {
        Self {
            conn,
            classifier,
            batch_size,
            max_parallel: max_parallel.max(1),
            batch_delay,
            stats: RunStats::new(),
        }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Classify every not-yet-completed record of one source, returning the
    /// labels produced by this run keyed by row index. Previously completed
    /// identities are skipped and absent from the returned map.
    pub async fn process_source(
        &self,
        source_id: &str,
        records: &[VoterRecord],
    ) -> AppResult<HashMap<i64, Religion>> {
        let mut labels = HashMap::new();
        let windows: Vec<&[VoterRecord]> = records.chunks(self.batch_size).collect();

        for group in windows.chunks(self.max_parallel) {
            let started = Instant::now();

            let mut batches: Vec<Vec<VoterRecord>> = Vec::new();
            for window in group {
                let mut batch = Vec::with_capacity(window.len());
                for record in window.iter() {
                    if !ProgressCtrl::is_completed(&self.conn, source_id, record.row_index).await? {
                        batch.push(record.clone());
                    }
                }
                if !batch.is_empty() {
                    batches.push(batch);
                }
            }

            // Fully completed group: no call, no budget, no pacing.
            if batches.is_empty() {
                continue;
            }

            // Barrier join: the next group starts only once every batch in
            // this one has written its outcomes.
            let results = join_all(
                batches
                    .iter()
                    .map(|batch| self.process_batch(source_id, batch)),
            )
            .await;
            for result in results {
                labels.extend(result?);
            }

            // Smooths burstiness independently of the rate limiters.
            let elapsed = started.elapsed();
            if elapsed < self.batch_delay {
                tokio::time::sleep(self.batch_delay - elapsed).await;
            }
        }

        Ok(labels)
    }

    /// One classification call for a filtered, non-empty batch plus the
    /// durable write per record. Store write failures abort the batch; a
    /// soft-failed classification does not.
    async fn process_batch(
        &self,
        source_id: &str,
        batch: &[VoterRecord],
    ) -> AppResult<Vec<(i64, Religion)>> {
        let details: Vec<VoterDetails> = batch.iter().map(|r| r.details.clone()).collect();
        let verdict = self.classifier.classify(&details).await;

        let mut outcomes = Vec::with_capacity(batch.len());
        match &verdict.soft_failure {
            None => {
                for (record, religion) in batch.iter().zip(&verdict.labels) {
                    ProgressCtrl::mark_completed(&self.conn, source_id, record.row_index, *religion)
                        .await?;
                    outcomes.push((record.row_index, *religion));
                }
                self.stats.add_successful(batch.len() as u64);
            }
            Some(failure) => {
                // The fallback label still reaches the output; only the
                // store keeps the failed status for audit.
                for (record, religion) in batch.iter().zip(&verdict.labels) {
                    ProgressCtrl::mark_failed(
                        &self.conn,
                        source_id,
                        record.row_index,
                        &failure.error_msg,
                        failure.attempts,
                    )
                    .await?;
                    outcomes.push((record.row_index, *religion));
                }
                self.stats.add_failed(batch.len() as u64);
            }
        }

        Ok(outcomes)
    }

    /// Log a progress block after each file, with store-wide totals and an
    /// ETA from this run's processing rate.
    pub async fn print_progress(
        &self,
        current_file: &str,
        current_file_idx: usize,
        total_files: usize,
    ) -> AppResult<()> {
        let totals = ProgressCtrl::get_total_stats(&self.conn).await?;
        let snapshot = self.stats.snapshot();

        let completed_pct = if totals.total > 0 {
            totals.completed as f64 / totals.total as f64 * 100.0
        } else {
            0.0
        };

        tracing::info!("Files: {}/{} (current: {})", current_file_idx, total_files, current_file);
        tracing::info!(
            "Total records: {} (completed: {} [{:.1}%], failed: {})",
            totals.total,
            totals.completed,
            completed_pct,
            totals.failed
        );
        tracing::info!(
            "Processing rate: {:.1} records/min, elapsed: {:.1} minutes",
            snapshot.records_per_min,
            snapshot.elapsed.as_secs_f64() / 60.0
        );
        if snapshot.records_per_min > 0.0 {
            let remaining = totals.total.saturating_sub(totals.completed) as f64;
            tracing::info!("ETA: {:.1} minutes", remaining / snapshot.records_per_min);
        }

        Ok(())
    }
}
