//! Incremental rollup maintenance.
//!
//! Runs only inside the `mark_verified` transaction (see `event_store`), so
//! the verified-flag flip and every rollup increment commit or roll back as
//! one unit. Each increment is a storage-side upsert (`ON CONFLICT DO UPDATE
//! SET x = x + delta`): two concurrent verifications can never read the same
//! stale total, for the same actor or for the global singleton.

use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};

use crate::models::TrackerResult;

pub const PERIOD_KIND_MONTH: &str = "month";
pub const PERIOD_KIND_YEAR: &str = "year";

/// Apply one verification transition to the actor, period, and global
/// rollups. `verified_at` keys the month/year buckets.
pub fn apply_verified(
    tx: &Transaction<'_>,
    actor_id: &str,
    quantity_kg: f64,
    verified_at: DateTime<Utc>,
) -> TrackerResult<()> {
    let ts = verified_at.timestamp();

    tx.execute(
        "INSERT INTO actor_rollups (actor_id, total_kg, event_count, last_verified_at, updated_at)
         VALUES (?1, round(?2, 4), 1, ?3, ?3)
         ON CONFLICT(actor_id) DO UPDATE SET
             total_kg = round(total_kg + excluded.total_kg, 4),
             event_count = event_count + 1,
             last_verified_at = excluded.last_verified_at,
             updated_at = excluded.updated_at",
        params![actor_id, quantity_kg, ts],
    )?;

    for (kind, label) in [
        (PERIOD_KIND_MONTH, month_label(verified_at)),
        (PERIOD_KIND_YEAR, year_label(verified_at)),
    ] {
        tx.execute(
            "INSERT INTO period_rollups
                 (actor_id, period_kind, period_label, total_kg, event_count, updated_at)
             VALUES (?1, ?2, ?3, round(?4, 4), 1, ?5)
             ON CONFLICT(actor_id, period_kind, period_label) DO UPDATE SET
                 total_kg = round(total_kg + excluded.total_kg, 4),
                 event_count = event_count + 1,
                 updated_at = excluded.updated_at",
            params![actor_id, kind, label, quantity_kg, ts],
        )?;
    }

    tx.execute(
        "INSERT INTO global_rollup (id, total_kg, event_count, updated_at)
         VALUES (1, round(?1, 4), 1, ?2)
         ON CONFLICT(id) DO UPDATE SET
             total_kg = round(total_kg + excluded.total_kg, 4),
             event_count = event_count + 1,
             updated_at = excluded.updated_at",
        params![quantity_kg, ts],
    )?;

    Ok(())
}

pub fn month_label(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

pub fn year_label(at: DateTime<Utc>) -> String {
    at.format("%Y").to_string()
}
