//! Persistent event store
//!
//! Owns the queue and tombstone tables exclusively. All mutations are
//! serialized through the single mutex-guarded connection, so dedup checks
//! and counter updates are race-free.

use crate::error::{Error, Result};
use crate::types::{CaptureEvent, PrivacyScope, QueuedEvent, StoreOutcome, UploadStats};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::PathBuf;
use std::sync::Mutex;

/// Per-event retry backoff: `min(cap, base * 2^retry_count)` seconds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base delay in seconds
    pub base_secs: i64,
    /// Delay ceiling in seconds
    pub cap_secs: i64,
}

impl RetryPolicy {
    /// Delay before the next attempt, given the post-increment retry count
    pub fn delay_secs(&self, retry_count: i64) -> i64 {
        let shift = retry_count.clamp(0, 30) as u32;
        self.base_secs
            .saturating_mul(1i64 << shift)
            .min(self.cap_secs)
    }
}

/// Durable event store backed by SQLite
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open or create a store at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL for crash durability with concurrent readers
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Store operations
    // ============================================

    /// Persist a capture event, deduplicating on its idempotency key.
    ///
    /// A key already present in the queue or in the tombstone set makes the
    /// call a no-op success, not an error.
    pub fn store(&self, event: &CaptureEvent, now: DateTime<Utc>) -> Result<StoreOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let outcome = Self::store_in_tx(&tx, event, now)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Persist a batch of capture events in a single transaction.
    ///
    /// Per-item semantics match [`EventStore::store`]; the returned outcomes
    /// are in input order.
    pub fn store_batch(
        &self,
        events: &[CaptureEvent],
        now: DateTime<Utc>,
    ) -> Result<Vec<StoreOutcome>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(Self::store_in_tx(&tx, event, now)?);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    fn store_in_tx(
        tx: &Transaction,
        event: &CaptureEvent,
        now: DateTime<Utc>,
    ) -> Result<StoreOutcome> {
        let key = event.idempotency_key();

        // Tier (b): tombstones survive the originating event, so a crash
        // between upload-ack and local delete still dedups here.
        let tombstoned: Option<String> = tx
            .query_row(
                "SELECT key FROM processed_keys WHERE key = ?",
                [&key],
                |row| row.get(0),
            )
            .optional()?;
        if tombstoned.is_some() {
            tracing::debug!(idempotency_key = %key, "Skipping already-delivered event");
            return Ok(StoreOutcome::DuplicateSkipped);
        }

        // Tier (a): key still queued
        let queued: Option<i64> = tx
            .query_row(
                "SELECT id FROM queued_events WHERE idempotency_key = ?",
                [&key],
                |row| row.get(0),
            )
            .optional()?;
        if queued.is_some() {
            tracing::debug!(idempotency_key = %key, "Skipping already-queued event");
            return Ok(StoreOutcome::DuplicateSkipped);
        }

        tx.execute(
            r#"
            INSERT INTO queued_events
                (event_type, payload, occurred_at, created_at, processed,
                 source_tag, privacy_scope, consent_version, idempotency_key,
                 retry_count)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, 0)
            "#,
            params![
                event.event_type,
                event.payload,
                event.occurred_at.to_rfc3339(),
                now.to_rfc3339(),
                event.source_tag,
                event.privacy_scope.as_str(),
                event.consent_version,
                key,
            ],
        )?;

        Ok(StoreOutcome::Inserted)
    }

    // ============================================
    // Pending queries
    // ============================================

    /// Events due for delivery: unprocessed, with no backoff or an expired
    /// one, ordered by ascending occurrence time.
    pub fn get_pending_events(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM queued_events
            WHERE processed = 0
              AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            ORDER BY occurred_at ASC
            LIMIT ?2
            "#,
        )?;

        let events = stmt
            .query_map(params![now.to_rfc3339(), limit as i64], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }

    /// Count of undelivered events (due or backing off)
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queued_events WHERE processed = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Count of all rows in the queue, processed or not
    pub fn total_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM queued_events", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Count of retained dedup tombstones
    pub fn tombstone_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_keys", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    // ============================================
    // Delivery state transitions
    // ============================================

    /// Mark one event delivered: seed its tombstone and flip `processed`
    /// atomically.
    pub fn mark_processed(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::mark_processed_in_tx(&tx, id, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a batch of events delivered in a single transaction
    pub fn mark_batch_processed(&self, ids: &[i64], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for &id in ids {
            Self::mark_processed_in_tx(&tx, id, now)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_processed_in_tx(tx: &Transaction, id: i64, now: DateTime<Utc>) -> Result<()> {
        let key: Option<String> = tx
            .query_row(
                "SELECT idempotency_key FROM queued_events WHERE id = ?",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        let key = key.ok_or(Error::EventNotFound(id))?;

        tx.execute(
            "INSERT OR IGNORE INTO processed_keys (key, processed_at) VALUES (?1, ?2)",
            params![key, now.to_rfc3339()],
        )?;
        tx.execute(
            "UPDATE queued_events SET processed = 1 WHERE id = ?",
            [id],
        )?;
        Ok(())
    }

    /// Record a failed delivery attempt: bump the retry counter and push
    /// `next_retry_at` out by the policy's capped exponential delay.
    pub fn record_retry_failure(
        &self,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::record_retry_failure_in_tx(&tx, id, error, now, policy)?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failed delivery attempt for a whole batch in one transaction
    pub fn record_batch_retry_failure(
        &self,
        ids: &[i64],
        error: &str,
        now: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for &id in ids {
            Self::record_retry_failure_in_tx(&tx, id, error, now, policy)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record_retry_failure_in_tx(
        tx: &Transaction,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Result<()> {
        let retry_count: Option<i64> = tx
            .query_row(
                "SELECT retry_count FROM queued_events WHERE id = ? AND processed = 0",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        let retry_count = retry_count.ok_or(Error::EventNotFound(id))? + 1;
        let next_retry_at = now + Duration::seconds(policy.delay_secs(retry_count));

        tx.execute(
            r#"
            UPDATE queued_events
            SET retry_count = ?1, last_error = ?2, next_retry_at = ?3
            WHERE id = ?4
            "#,
            params![retry_count, error, next_retry_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    // ============================================
    // Maintenance deletes
    // ============================================

    /// Delete delivered events persisted more than `older_than_days` ago
    pub fn delete_old_events(&self, older_than_days: i64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(older_than_days);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM queued_events WHERE processed = 1 AND created_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    /// Delete all delivered events immediately
    pub fn delete_processed_events(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM queued_events WHERE processed = 1", [])?;
        Ok(deleted)
    }

    /// Drop events that have exhausted their delivery attempts.
    ///
    /// These are gone for good; callers log the loss.
    pub fn delete_failed_events(&self, max_retries: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM queued_events WHERE processed = 0 AND retry_count >= ?",
            [max_retries],
        )?;
        Ok(deleted)
    }

    /// Prune tombstones older than the retention window.
    ///
    /// Independent of the originating events, which may be long gone.
    pub fn prune_tombstones(&self, retention_days: i64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(retention_days);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM processed_keys WHERE processed_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    /// Evict oldest delivered events until the queue fits `max_size`.
    ///
    /// Unprocessed events are never evicted; if the queue is still over the
    /// limit after all delivered rows are gone, the excess stays and the
    /// enqueue path's QueueFull check is the bound on further growth.
    pub fn trim(&self, max_size: usize) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let total: i64 = tx.query_row("SELECT COUNT(*) FROM queued_events", [], |r| r.get(0))?;
        let excess = total - max_size as i64;
        if excess <= 0 {
            return Ok(0);
        }

        let deleted = tx.execute(
            r#"
            DELETE FROM queued_events WHERE id IN (
                SELECT id FROM queued_events
                WHERE processed = 1
                ORDER BY occurred_at ASC
                LIMIT ?
            )
            "#,
            [excess],
        )?;
        tx.commit()?;

        if (deleted as i64) < excess {
            tracing::warn!(
                total = total,
                max_size,
                evicted = deleted,
                "Queue over capacity with no evictable processed events"
            );
        }

        Ok(deleted)
    }

    // ============================================
    // Upload stats
    // ============================================

    /// Read persisted delivery statistics
    pub fn get_stats(&self) -> Result<UploadStats> {
        let conn = self.conn.lock().unwrap();

        let get = |key: &str| -> rusqlite::Result<Option<String>> {
            conn.query_row(
                "SELECT value FROM pipeline_meta WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()
        };

        let total_uploaded = get("total_uploaded")?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let last_upload_at = get("last_upload_at")?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let pending_after_last_flush = get("pending_after_last_flush")?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(UploadStats {
            total_uploaded,
            last_upload_at,
            pending_after_last_flush,
        })
    }

    /// Record a successful upload of `count` events, with `remaining` still
    /// pending afterwards
    pub fn record_upload(
        &self,
        count: usize,
        remaining: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let total: i64 = tx
            .query_row(
                "SELECT value FROM pipeline_meta WHERE key = 'total_uploaded'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let upsert = "INSERT INTO pipeline_meta (key, value) VALUES (?1, ?2)
                      ON CONFLICT(key) DO UPDATE SET value = excluded.value";
        tx.execute(upsert, params!["total_uploaded", (total + count as i64).to_string()])?;
        tx.execute(upsert, params!["last_upload_at", now.to_rfc3339()])?;
        tx.execute(upsert, params!["pending_after_last_flush", remaining.to_string()])?;

        tx.commit()?;
        Ok(())
    }

    // ============================================
    // Row mapping
    // ============================================

    fn row_to_event(row: &Row) -> rusqlite::Result<QueuedEvent> {
        let occurred_at_str: String = row.get("occurred_at")?;
        let created_at_str: String = row.get("created_at")?;
        let next_retry_str: Option<String> = row.get("next_retry_at")?;
        let scope_str: String = row.get("privacy_scope")?;

        Ok(QueuedEvent {
            id: row.get("id")?,
            event_type: row.get("event_type")?,
            payload: row.get("payload")?,
            occurred_at: DateTime::parse_from_rfc3339(&occurred_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            processed: row.get::<_, i64>("processed")? != 0,
            source_tag: row.get("source_tag")?,
            privacy_scope: scope_str.parse().unwrap_or(PrivacyScope::Private),
            consent_version: row.get("consent_version")?,
            idempotency_key: row.get("idempotency_key")?,
            retry_count: row.get("retry_count")?,
            last_error: row.get("last_error")?,
            next_retry_at: next_retry_str
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }
}
