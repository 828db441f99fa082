//! Append-only event store
//!
//! `append` and `mark_verified` are the only write entry points for action
//! events. Verification is the sole aggregation trigger: the flag flip and
//! the rollup increments run in one IMMEDIATE transaction, so they commit or
//! roll back together. Re-delivery of a verification (the verifier is
//! at-least-once) is a no-op, which is what keeps the aggregator from ever
//! firing twice for one event.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{ActionEvent, EventSummary, TrackerError, TrackerResult, VerifyOutcome};
use crate::tracker::aggregator;
use crate::tracker::db::SavingsDb;
use crate::tracker::units::{round4, MassUnit};

const MAX_ACTOR_ID_LEN: usize = 128;

/// Store for submitted actions and their verification state
#[derive(Clone)]
pub struct EventStore {
    db: SavingsDb,
}

impl EventStore {
    pub fn new(db: SavingsDb) -> Self {
        Self { db }
    }

    /// Record a submitted action, unverified. Returns the new event id.
    pub fn append(&self, actor_id: &str, quantity: f64, unit: MassUnit) -> TrackerResult<String> {
        let actor_id = validate_actor_id(actor_id)?;
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(TrackerError::InvalidInput(
                "quantity must be a positive number".to_string(),
            ));
        }
        let quantity_kg = round4(unit.to_kg(quantity));
        if quantity_kg <= 0.0 {
            return Err(TrackerError::InvalidInput(
                "quantity is below the 0.0001 kg resolution".to_string(),
            ));
        }

        let event_id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp();

        self.db.write_tx("append_event", |tx| {
            tx.execute(
                "INSERT INTO action_events (id, actor_id, quantity_kg, verified, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![event_id, actor_id, quantity_kg, created_at],
            )?;
            Ok(())
        })?;

        debug!(
            "🌱 Recorded action {} for {} ({} kg)",
            event_id, actor_id, quantity_kg
        );
        Ok(event_id)
    }

    /// Flip an event to verified and apply its delta to the rollups, as one
    /// atomic unit. Idempotent: a second call for the same event is a no-op.
    pub fn mark_verified(&self, event_id: &str) -> TrackerResult<VerifyOutcome> {
        let verified_at = Utc::now();

        let outcome = self.db.write_tx("mark_verified", |tx| {
            let row: Option<(String, f64, bool)> = tx
                .query_row(
                    "SELECT actor_id, quantity_kg, verified FROM action_events WHERE id = ?1",
                    params![event_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((actor_id, quantity_kg, already_verified)) = row else {
                return Err(TrackerError::NotFound(format!("event {}", event_id)));
            };
            if already_verified {
                return Ok(VerifyOutcome::AlreadyVerified);
            }

            // Guarded update: the WHERE clause keeps verified_at write-once
            // even if two transactions raced past the read above.
            let flipped = tx.execute(
                "UPDATE action_events SET verified = 1, verified_at = ?2
                 WHERE id = ?1 AND verified = 0",
                params![event_id, verified_at.timestamp()],
            )?;
            if flipped == 0 {
                return Ok(VerifyOutcome::AlreadyVerified);
            }

            aggregator::apply_verified(tx, &actor_id, quantity_kg, verified_at)?;
            Ok(VerifyOutcome::Verified)
        })?;

        match outcome {
            VerifyOutcome::Verified => info!("✅ Verified event {}", event_id),
            VerifyOutcome::AlreadyVerified => {
                debug!("↩️  Event {} already verified, no-op", event_id)
            }
        }
        Ok(outcome)
    }

    pub fn get_event(&self, event_id: &str) -> TrackerResult<Option<ActionEvent>> {
        let conn = self.db.conn();
        let event = conn
            .query_row(
                "SELECT id, actor_id, quantity_kg, verified, created_at, verified_at
                 FROM action_events WHERE id = ?1",
                params![event_id],
                |row| {
                    Ok(ActionEvent {
                        id: row.get(0)?,
                        actor_id: row.get(1)?,
                        quantity_kg: row.get(2)?,
                        verified: row.get(3)?,
                        created_at: row.get(4)?,
                        verified_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(event)
    }

    /// Recent events, newest first, optionally filtered to one actor
    pub fn recent_events(
        &self,
        actor_id: Option<&str>,
        limit: usize,
    ) -> TrackerResult<Vec<EventSummary>> {
        let conn = self.db.conn();
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(EventSummary {
                id: row.get(0)?,
                actor_id: row.get(1)?,
                quantity_kg: row.get(2)?,
                verified: row.get(3)?,
                created_at: row.get(4)?,
            })
        };

        let events = match actor_id {
            Some(actor) => {
                let mut stmt = conn.prepare(
                    "SELECT id, actor_id, quantity_kg, verified, created_at
                     FROM action_events WHERE actor_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![actor, limit as i64], map_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, actor_id, quantity_kg, verified, created_at
                     FROM action_events
                     ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], map_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(events)
    }

    /// Display-name seam for the identity service
    pub fn upsert_profile(&self, actor_id: &str, display_name: &str) -> TrackerResult<()> {
        let actor_id = validate_actor_id(actor_id)?;
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(TrackerError::InvalidInput(
                "display name must not be empty".to_string(),
            ));
        }

        self.db.write_tx("upsert_profile", |tx| {
            tx.execute(
                "INSERT INTO actor_profiles (actor_id, display_name, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(actor_id) DO UPDATE SET
                     display_name = excluded.display_name,
                     updated_at = excluded.updated_at",
                params![actor_id, display_name, Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }
}

fn validate_actor_id(actor_id: &str) -> TrackerResult<&str> {
    let trimmed = actor_id.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::InvalidInput(
            "actor id must not be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_ACTOR_ID_LEN {
        return Err(TrackerError::InvalidInput(format!(
            "actor id exceeds {} characters",
            MAX_ACTOR_ID_LEN
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (EventStore, SavingsDb, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let db = SavingsDb::open(temp.path().to_str().unwrap()).unwrap();
        (EventStore::new(db.clone()), db, temp)
    }

    #[test]
    fn test_append_rejects_bad_input() {
        let (store, _db, _temp) = create_test_store();

        assert!(matches!(
            store.append("actor-1", 0.0, MassUnit::Kilograms),
            Err(TrackerError::InvalidInput(_))
        ));
        assert!(matches!(
            store.append("actor-1", -2.0, MassUnit::Kilograms),
            Err(TrackerError::InvalidInput(_))
        ));
        assert!(matches!(
            store.append("actor-1", f64::NAN, MassUnit::Kilograms),
            Err(TrackerError::InvalidInput(_))
        ));
        assert!(matches!(
            store.append("   ", 1.0, MassUnit::Kilograms),
            Err(TrackerError::InvalidInput(_))
        ));
        // 0.01 g rounds below the stored resolution
        assert!(matches!(
            store.append("actor-1", 0.01, MassUnit::Grams),
            Err(TrackerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_append_converts_to_kg() {
        let (store, _db, _temp) = create_test_store();
        let id = store.append("actor-1", 500.0, MassUnit::Grams).unwrap();
        let event = store.get_event(&id).unwrap().unwrap();
        assert_eq!(event.quantity_kg, 0.5);
        assert!(!event.verified);
        assert!(event.verified_at.is_none());
    }

    #[test]
    fn test_mark_verified_not_found() {
        let (store, _db, _temp) = create_test_store();
        assert!(matches!(
            store.mark_verified("no-such-event"),
            Err(TrackerError::NotFound(_))
        ));
    }

    #[test]
    fn test_mark_verified_updates_rollups_once() {
        let (store, db, _temp) = create_test_store();
        let id = store.append("actor-1", 5.0, MassUnit::Kilograms).unwrap();

        assert_eq!(store.mark_verified(&id).unwrap(), VerifyOutcome::Verified);

        let event = store.get_event(&id).unwrap().unwrap();
        assert!(event.verified);
        let first_verified_at = event.verified_at.expect("verified_at set on transition");

        // At-least-once delivery: the repeat must change nothing
        assert_eq!(
            store.mark_verified(&id).unwrap(),
            VerifyOutcome::AlreadyVerified
        );
        let event = store.get_event(&id).unwrap().unwrap();
        assert_eq!(event.verified_at, Some(first_verified_at));

        let conn = db.conn();
        let (total, count): (f64, i64) = conn
            .query_row(
                "SELECT total_kg, event_count FROM actor_rollups WHERE actor_id = 'actor-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(total, 5.0);
        assert_eq!(count, 1);

        let gtotal: f64 = conn
            .query_row("SELECT total_kg FROM global_rollup WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(gtotal, 5.0);
    }

    #[test]
    fn test_unverified_events_do_not_aggregate() {
        let (store, db, _temp) = create_test_store();
        store.append("actor-1", 5.0, MassUnit::Kilograms).unwrap();

        let rollups: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM actor_rollups", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rollups, 0);
    }

    #[test]
    fn test_concurrent_verification_no_lost_updates() {
        let (store, db, _temp) = create_test_store();

        // 4 threads x 25 events, all for the same actor
        let mut ids = Vec::new();
        for _ in 0..100 {
            ids.push(store.append("actor-1", 1.0, MassUnit::Kilograms).unwrap());
        }

        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for chunk in ids.chunks(25) {
            let store = store.clone();
            let chunk = chunk.to_vec();
            handles.push(std::thread::spawn(move || {
                for id in chunk {
                    store.mark_verified(&id).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let (total, count): (f64, i64) = db
            .conn()
            .query_row(
                "SELECT total_kg, event_count FROM actor_rollups WHERE actor_id = 'actor-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(total, 100.0);
        assert_eq!(count, 100);

        let gtotal: f64 = db
            .conn()
            .query_row("SELECT total_kg FROM global_rollup WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(gtotal, 100.0);
    }

    #[test]
    fn test_recent_events_newest_first() {
        let (store, _db, _temp) = create_test_store();
        let a = store.append("actor-1", 1.0, MassUnit::Kilograms).unwrap();
        let b = store.append("actor-2", 2.0, MassUnit::Kilograms).unwrap();

        let all = store.recent_events(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        // Same-second inserts: both present, bounded by limit
        let only_a = store.recent_events(Some("actor-1"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id, a);

        let limited = store.recent_events(None, 1).unwrap();
        assert_eq!(limited.len(), 1);
        let _ = b;
    }
}
