//! Queue maintenance policy over the event store
//!
//! The store knows how to mutate rows; this layer knows when. Retention,
//! failed-event garbage collection, tombstone pruning, and capacity trims
//! all run through [`QueueManager::run_maintenance`], which the scheduler
//! invokes on a slow cadence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::PipelineConfig;
use crate::db::{EventStore, RetryPolicy};
use crate::error::Result;
use crate::types::QueuedEvent;

/// Summary of one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Delivered events past the retention window
    pub expired: usize,
    /// Undelivered events dropped after exhausting retries
    pub failed_dropped: usize,
    /// Dedup tombstones pruned by age
    pub tombstones_pruned: usize,
    /// Delivered events evicted under capacity pressure
    pub trimmed: usize,
}

/// Query and maintenance operations over the persistent store
pub struct QueueManager {
    store: Arc<EventStore>,
    config: PipelineConfig,
}

impl QueueManager {
    pub fn new(store: Arc<EventStore>, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Backoff policy for failed delivery attempts
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_secs: self.config.retry_base_secs,
            cap_secs: self.config.retry_cap_secs,
        }
    }

    /// Events due for delivery, oldest occurrence first
    pub fn get_pending_events(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<QueuedEvent>> {
        self.store.get_pending_events(limit, now)
    }

    /// Count of undelivered events
    pub fn pending_count(&self) -> Result<usize> {
        self.store.pending_count()
    }

    /// Count of all queued rows
    pub fn total_count(&self) -> Result<usize> {
        self.store.total_count()
    }

    /// Mark a delivered batch processed (tombstones seeded atomically)
    pub fn mark_batch_processed(&self, ids: &[i64], now: DateTime<Utc>) -> Result<()> {
        self.store.mark_batch_processed(ids, now)
    }

    /// Record a failed delivery attempt against every event in a batch
    pub fn record_batch_retry_failure(
        &self,
        ids: &[i64],
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .record_batch_retry_failure(ids, error, now, self.retry_policy())
    }

    /// One full maintenance sweep: retention, failed-event GC, tombstone
    /// pruning, and capacity trim.
    pub fn run_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let expired = self
            .store
            .delete_old_events(self.config.retention_days, now)?;

        let failed_dropped = self.store.delete_failed_events(self.config.max_retries)?;
        if failed_dropped > 0 {
            // Deliberate best-effort trade-off: these events are lost
            tracing::warn!(
                count = failed_dropped,
                max_retries = self.config.max_retries,
                "Dropped events that exhausted their delivery attempts"
            );
        }

        let tombstones_pruned = self
            .store
            .prune_tombstones(self.config.tombstone_retention_days, now)?;

        let trimmed = self.store.trim(self.config.max_queue_size)?;
        if trimmed > 0 {
            tracing::warn!(
                count = trimmed,
                max_queue_size = self.config.max_queue_size,
                "Evicted delivered events under capacity pressure"
            );
        }

        let report = MaintenanceReport {
            expired,
            failed_dropped,
            tombstones_pruned,
            trimmed,
        };

        tracing::debug!(?report, "Maintenance sweep complete");
        Ok(report)
    }
}
