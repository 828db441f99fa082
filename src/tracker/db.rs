//! SQLite layer for the savings tracker
//!
//! Key choices, carried over from operating the event log at volume:
//! - WAL mode for concurrent reads during writes
//! - One connection behind a parking_lot mutex; SQLite's own mutex disabled
//! - Versioned migrations gated on `PRAGMA user_version`
//! - All rollup increments are storage-side upserts, never read-modify-write
//! - Bounded retry on busy/locked, surfacing as a Conflict after exhaustion

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::{TrackerError, TrackerResult};

/// Generation 1: the append-only event log.
const MIGRATION_V1_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS action_events (
    id TEXT PRIMARY KEY,
    actor_id TEXT NOT NULL,
    quantity_kg REAL NOT NULL CHECK (quantity_kg > 0),
    verified INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    verified_at INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_action_events_created
    ON action_events(created_at DESC);

CREATE INDEX IF NOT EXISTS idx_action_events_actor_created
    ON action_events(actor_id, created_at DESC);

-- Verified events per actor, newest verification first (tie-break source)
CREATE INDEX IF NOT EXISTS idx_action_events_actor_verified
    ON action_events(actor_id, verified_at DESC) WHERE verified = 1;
"#;

/// Generation 2: incremental rollups so reads never scan the event log.
const MIGRATION_V2_ROLLUPS: &str = r#"
CREATE TABLE IF NOT EXISTS actor_rollups (
    actor_id TEXT PRIMARY KEY,
    total_kg REAL NOT NULL DEFAULT 0,
    event_count INTEGER NOT NULL DEFAULT 0,
    last_verified_at INTEGER,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_actor_rollups_total
    ON actor_rollups(total_kg DESC);

CREATE TABLE IF NOT EXISTS period_rollups (
    actor_id TEXT NOT NULL,
    period_kind TEXT NOT NULL,
    period_label TEXT NOT NULL,
    total_kg REAL NOT NULL DEFAULT 0,
    event_count INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (actor_id, period_kind, period_label)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_period_rollups_label_total
    ON period_rollups(period_kind, period_label, total_kg DESC);

CREATE TABLE IF NOT EXISTS global_rollup (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    total_kg REAL NOT NULL DEFAULT 0,
    event_count INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);
"#;

/// Generation 3: reconcile audit trail and display-name seam.
const MIGRATION_V3_AUDIT: &str = r#"
CREATE TABLE IF NOT EXISTS reconcile_audit (
    id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    actor_sum_kg REAL NOT NULL,
    global_kg REAL NOT NULL,
    discrepancy_kg REAL NOT NULL,
    was_in_sync INTEGER NOT NULL,
    fixed INTEGER NOT NULL,
    detail TEXT
);

CREATE INDEX IF NOT EXISTS idx_reconcile_audit_ts
    ON reconcile_audit(ts DESC);

CREATE TABLE IF NOT EXISTS actor_profiles (
    actor_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Migrations in order; `PRAGMA user_version` records how many have run.
/// Older deployments also carry `user_stats` / `community_stats` /
/// `impact_totals` tables from previous app generations. Those are read-side
/// fallbacks only (see `read_adapter`): never created, written, or dropped
/// here.
const MIGRATIONS: &[&str] = &[MIGRATION_V1_EVENTS, MIGRATION_V2_ROLLUPS, MIGRATION_V3_AUDIT];

const PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Shared SQLite handle for the tracker
#[derive(Clone)]
pub struct SavingsDb {
    conn: Arc<Mutex<Connection>>,
}

impl SavingsDb {
    /// Open (creating if needed) and migrate the tracker database
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let mut conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(PRAGMAS_SQL)
            .context("Failed to apply pragmas")?;

        // Verify WAL mode is active
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Self::migrate(&mut conn)?;

        info!("📊 Savings database ready at: {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &mut Connection) -> Result<()> {
        let applied: u32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("Failed to read user_version")?;

        if (applied as usize) >= MIGRATIONS.len() {
            return Ok(());
        }

        for (idx, sql) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
            let version = idx as u32 + 1;
            let tx = conn
                .transaction()
                .context("Failed to begin migration transaction")?;
            tx.execute_batch(sql)
                .with_context(|| format!("Migration v{} failed", version))?;
            tx.pragma_update(None, "user_version", version)
                .with_context(|| format!("Failed to set user_version {}", version))?;
            tx.commit()
                .with_context(|| format!("Failed to commit migration v{}", version))?;
            info!("🧱 Applied schema migration v{}", version);
        }

        Ok(())
    }

    /// Lock the connection for a read. Keep the guard short-lived.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` inside an IMMEDIATE transaction. Busy/locked conflicts roll
    /// the whole unit back and retry up to MAX_WRITE_ATTEMPTS; exhaustion
    /// surfaces as `Conflict`. Partial attempts leave no state behind.
    pub fn write_tx<T>(
        &self,
        op: &str,
        f: impl Fn(&Transaction<'_>) -> TrackerResult<T>,
    ) -> TrackerResult<T> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.attempt_write_tx(&f) {
                Err(e) if is_retryable(&e) && attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(
                        "⏳ {} hit a storage conflict (attempt {}/{}): {}",
                        op, attempt, MAX_WRITE_ATTEMPTS, e
                    );
                    std::thread::sleep(Duration::from_millis(20 * attempt as u64));
                }
                Err(e) if is_retryable(&e) => {
                    return Err(TrackerError::Conflict(format!(
                        "{}: retries exhausted after {} attempts",
                        op, MAX_WRITE_ATTEMPTS
                    )));
                }
                other => return other,
            }
        }
        unreachable!("write_tx retry loop always returns")
    }

    fn attempt_write_tx<T>(
        &self,
        f: &impl Fn(&Transaction<'_>) -> TrackerResult<T>,
    ) -> TrackerResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite)?;
        // An error here drops the transaction, which rolls it back
        let value = f(&tx)?;
        tx.commit().map_err(map_sqlite)?;
        Ok(value)
    }
}

fn map_sqlite(err: rusqlite::Error) -> TrackerError {
    if is_busy_sqlite(&err) {
        TrackerError::Conflict(err.to_string())
    } else {
        TrackerError::from(err)
    }
}

fn is_retryable(err: &TrackerError) -> bool {
    match err {
        TrackerError::Conflict(_) => true,
        // Closures map rusqlite errors straight into Storage; catch busy here
        TrackerError::Storage(inner) => inner
            .downcast_ref::<rusqlite::Error>()
            .is_some_and(is_busy_sqlite),
        _ => false,
    }
}

/// Does a table exist? Used by the read adapter to probe older generations.
pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn is_busy_sqlite(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
