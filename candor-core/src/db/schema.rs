//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Queue: events awaiting (or after) delivery
    -- ============================================

    CREATE TABLE IF NOT EXISTS queued_events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type       TEXT NOT NULL,
        payload          BLOB NOT NULL,
        occurred_at      DATETIME NOT NULL,
        created_at       DATETIME NOT NULL,
        processed        INTEGER NOT NULL DEFAULT 0,
        source_tag       TEXT NOT NULL,
        privacy_scope    TEXT NOT NULL,
        consent_version  INTEGER NOT NULL,
        idempotency_key  TEXT NOT NULL UNIQUE,
        retry_count      INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT,
        next_retry_at    DATETIME
    );

    -- ============================================
    -- Dedup tombstones: delivered keys, age-pruned
    -- ============================================

    CREATE TABLE IF NOT EXISTS processed_keys (
        key              TEXT PRIMARY KEY,
        processed_at     DATETIME NOT NULL
    );

    -- ============================================
    -- Pipeline metadata (upload stats)
    -- ============================================

    CREATE TABLE IF NOT EXISTS pipeline_meta (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_queued_pending
        ON queued_events(processed, next_retry_at, occurred_at);
    CREATE INDEX IF NOT EXISTS idx_queued_occurred ON queued_events(occurred_at);
    CREATE INDEX IF NOT EXISTS idx_queued_retry ON queued_events(retry_count)
        WHERE processed = 0;
    CREATE INDEX IF NOT EXISTS idx_processed_keys_age ON processed_keys(processed_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
