//! Multi-generation read fallback.
//!
//! The durable schema has been reshaped more than once as the product
//! evolved; older deployments still carry the previous tables. Every read
//! goes through a prioritized source cascade:
//!
//!   1. current generation: `actor_rollups` / `global_rollup` / buckets
//!   2. prior generation:   `user_stats` / `community_stats` / `user_actions`
//!   3. legacy generation:  `impact_totals` (gram-denominated)
//!   4. recomputation from the `action_events` log
//!
//! The first source that yields a present, non-empty result wins, and a
//! response never mixes fields from two generations. Providers report
//! `Ok(None)` for "no data" so an empty generation cannot mask a real error.
//! Recomputation is always correct but carries no O(1) cost bound.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::models::{
    ActorRollup, EventSummary, GlobalRollup, LeaderboardEntry, Period, Scope, TrackerResult,
};
use crate::tracker::db::{table_exists, SavingsDb};
use crate::tracker::leaderboard::{fetch_values, order_and_rank, RankedValue};

/// One read-side data generation
trait ReadSource {
    fn name(&self) -> &'static str;

    fn actor_rollup(&self, conn: &Connection, actor_id: &str) -> Result<Option<ActorRollup>>;

    fn global_rollup(&self, conn: &Connection) -> Result<Option<GlobalRollup>>;

    fn leaderboard(
        &self,
        conn: &Connection,
        period: Period,
        scope: &Scope,
        limit: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Vec<LeaderboardEntry>>>;

    fn recent_events(
        &self,
        conn: &Connection,
        actor_id: Option<&str>,
        limit: usize,
    ) -> Result<Option<Vec<EventSummary>>>;
}

/// Prioritized-source resolver for all read queries
pub struct ReadAdapter {
    db: SavingsDb,
    sources: Vec<Box<dyn ReadSource + Send + Sync>>,
}

impl ReadAdapter {
    pub fn new(db: SavingsDb) -> Self {
        Self {
            db,
            sources: vec![
                Box::new(CurrentGen),
                Box::new(PriorGen),
                Box::new(LegacyGen),
                Box::new(Recompute),
            ],
        }
    }

    pub fn actor_rollup(&self, actor_id: &str) -> TrackerResult<Option<ActorRollup>> {
        let conn = self.db.conn();
        for source in &self.sources {
            if let Some(rollup) = source.actor_rollup(&conn, actor_id)? {
                debug!("📖 actor rollup {} served by {}", actor_id, source.name());
                return Ok(Some(rollup));
            }
        }
        // Legitimate empty state: a new actor with no verified events
        Ok(None)
    }

    pub fn global_rollup(&self) -> TrackerResult<GlobalRollup> {
        let conn = self.db.conn();
        for source in &self.sources {
            if let Some(rollup) = source.global_rollup(&conn)? {
                debug!("📖 global rollup served by {}", source.name());
                return Ok(rollup);
            }
        }
        Ok(GlobalRollup {
            total_kg: 0.0,
            event_count: 0,
            updated_at: 0,
        })
    }

    pub fn leaderboard(
        &self,
        period: Period,
        scope: &Scope,
        limit: usize,
    ) -> TrackerResult<Vec<LeaderboardEntry>> {
        let as_of = Utc::now();
        let conn = self.db.conn();
        for source in &self.sources {
            if let Some(board) = source.leaderboard(&conn, period, scope, limit, as_of)? {
                debug!(
                    "📖 {} leaderboard served by {}",
                    period.as_str(),
                    source.name()
                );
                return Ok(board);
            }
        }
        Ok(Vec::new())
    }

    pub fn recent_events(
        &self,
        actor_id: Option<&str>,
        limit: usize,
    ) -> TrackerResult<Vec<EventSummary>> {
        let conn = self.db.conn();
        for source in &self.sources {
            if let Some(events) = source.recent_events(&conn, actor_id, limit)? {
                debug!("📖 recent events served by {}", source.name());
                return Ok(events);
            }
        }
        Ok(Vec::new())
    }
}

// ===== Generation 3 (current): rollup tables =====

struct CurrentGen;

impl ReadSource for CurrentGen {
    fn name(&self) -> &'static str {
        "current"
    }

    fn actor_rollup(&self, conn: &Connection, actor_id: &str) -> Result<Option<ActorRollup>> {
        let rollup = conn
            .query_row(
                "SELECT actor_id, total_kg, event_count, last_verified_at, updated_at
                 FROM actor_rollups WHERE actor_id = ?1",
                params![actor_id],
                |row| {
                    Ok(ActorRollup {
                        actor_id: row.get(0)?,
                        total_kg: row.get(1)?,
                        event_count: row.get(2)?,
                        last_verified_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(rollup)
    }

    fn global_rollup(&self, conn: &Connection) -> Result<Option<GlobalRollup>> {
        let rollup = conn
            .query_row(
                "SELECT total_kg, event_count, updated_at FROM global_rollup WHERE id = 1",
                [],
                |row| {
                    Ok(GlobalRollup {
                        total_kg: row.get(0)?,
                        event_count: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(rollup)
    }

    fn leaderboard(
        &self,
        conn: &Connection,
        period: Period,
        scope: &Scope,
        limit: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Vec<LeaderboardEntry>>> {
        let rows = fetch_values(conn, period, scope, as_of).map_err(anyhow::Error::from)?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(order_and_rank(rows, period, limit, as_of)))
    }

    fn recent_events(
        &self,
        conn: &Connection,
        actor_id: Option<&str>,
        limit: usize,
    ) -> Result<Option<Vec<EventSummary>>> {
        let events = query_event_summaries(
            conn,
            "action_events",
            ("id", "actor_id", "quantity_kg", "verified", "created_at"),
            actor_id,
            limit,
        )?;
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(events))
    }
}

// ===== Generation 2 (prior): denormalized per-user stats =====

struct PriorGen;

impl ReadSource for PriorGen {
    fn name(&self) -> &'static str {
        "prior"
    }

    fn actor_rollup(&self, conn: &Connection, actor_id: &str) -> Result<Option<ActorRollup>> {
        if !table_exists(conn, "user_stats")? {
            return Ok(None);
        }
        let rollup = conn
            .query_row(
                "SELECT user_id, co2_saved_kg, action_count, last_action_at, updated_at
                 FROM user_stats WHERE user_id = ?1",
                params![actor_id],
                |row| {
                    Ok(ActorRollup {
                        actor_id: row.get(0)?,
                        total_kg: row.get(1)?,
                        event_count: row.get(2)?,
                        last_verified_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(rollup)
    }

    fn global_rollup(&self, conn: &Connection) -> Result<Option<GlobalRollup>> {
        if !table_exists(conn, "community_stats")? {
            return Ok(None);
        }
        let rollup = conn
            .query_row(
                "SELECT co2_saved_kg, action_count, updated_at
                 FROM community_stats WHERE id = 1",
                [],
                |row| {
                    Ok(GlobalRollup {
                        total_kg: row.get(0)?,
                        event_count: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(rollup)
    }

    fn leaderboard(
        &self,
        conn: &Connection,
        period: Period,
        scope: &Scope,
        limit: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Vec<LeaderboardEntry>>> {
        // The prior schema kept no period buckets; only the all-time board
        // can be served without inventing data.
        if period != Period::AllTime || !table_exists(conn, "user_stats")? {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            "SELECT user_id, display_name, co2_saved_kg, last_action_at
             FROM user_stats WHERE co2_saved_kg > 0",
        )?;
        let mut rows = stmt
            .query_map([], |row| {
                Ok(RankedValue {
                    actor_id: row.get(0)?,
                    display_name: row.get(1)?,
                    value_kg: row.get(2)?,
                    last_verified_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if let Scope::Actors(actors) = scope {
            rows.retain(|r| actors.contains(&r.actor_id));
        }
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(order_and_rank(rows, period, limit, as_of)))
    }

    fn recent_events(
        &self,
        conn: &Connection,
        actor_id: Option<&str>,
        limit: usize,
    ) -> Result<Option<Vec<EventSummary>>> {
        if !table_exists(conn, "user_actions")? {
            return Ok(None);
        }
        let events = query_event_summaries(
            conn,
            "user_actions",
            ("id", "user_id", "co2_kg", "is_verified", "logged_at"),
            actor_id,
            limit,
        )?;
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(events))
    }
}

// ===== Generation 1 (legacy): gram-denominated totals =====

struct LegacyGen;

impl ReadSource for LegacyGen {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn actor_rollup(&self, conn: &Connection, actor_id: &str) -> Result<Option<ActorRollup>> {
        if !table_exists(conn, "impact_totals")? {
            return Ok(None);
        }
        let rollup = conn
            .query_row(
                "SELECT user_id, total_g, updated_at FROM impact_totals WHERE user_id = ?1",
                params![actor_id],
                |row| {
                    let total_g: i64 = row.get(1)?;
                    Ok(ActorRollup {
                        actor_id: row.get(0)?,
                        total_kg: total_g as f64 / 1000.0,
                        // The legacy schema kept no event count or recency
                        event_count: 0,
                        last_verified_at: None,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(rollup)
    }

    fn global_rollup(&self, _conn: &Connection) -> Result<Option<GlobalRollup>> {
        // Legacy never stored a community total
        Ok(None)
    }

    fn leaderboard(
        &self,
        conn: &Connection,
        period: Period,
        scope: &Scope,
        limit: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Vec<LeaderboardEntry>>> {
        if period != Period::AllTime || !table_exists(conn, "impact_totals")? {
            return Ok(None);
        }

        let mut stmt =
            conn.prepare("SELECT user_id, total_g FROM impact_totals WHERE total_g > 0")?;
        let mut rows = stmt
            .query_map([], |row| {
                let total_g: i64 = row.get(1)?;
                Ok(RankedValue {
                    actor_id: row.get(0)?,
                    display_name: None,
                    value_kg: total_g as f64 / 1000.0,
                    last_verified_at: None,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if let Scope::Actors(actors) = scope {
            rows.retain(|r| actors.contains(&r.actor_id));
        }
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(order_and_rank(rows, period, limit, as_of)))
    }

    fn recent_events(
        &self,
        _conn: &Connection,
        _actor_id: Option<&str>,
        _limit: usize,
    ) -> Result<Option<Vec<EventSummary>>> {
        Ok(None)
    }
}

// ===== Last resort: recompute from the event log =====

struct Recompute;

impl ReadSource for Recompute {
    fn name(&self) -> &'static str {
        "recompute"
    }

    fn actor_rollup(&self, conn: &Connection, actor_id: &str) -> Result<Option<ActorRollup>> {
        let (total, count, last): (f64, i64, Option<i64>) = conn.query_row(
            "SELECT COALESCE(ROUND(SUM(quantity_kg), 4), 0), COUNT(*), MAX(verified_at)
             FROM action_events WHERE verified = 1 AND actor_id = ?1",
            params![actor_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(ActorRollup {
            actor_id: actor_id.to_string(),
            total_kg: total,
            event_count: count,
            last_verified_at: last,
            updated_at: last.unwrap_or(0),
        }))
    }

    fn global_rollup(&self, conn: &Connection) -> Result<Option<GlobalRollup>> {
        let (total, count, last): (f64, i64, Option<i64>) = conn.query_row(
            "SELECT COALESCE(ROUND(SUM(quantity_kg), 4), 0), COUNT(*), MAX(verified_at)
             FROM action_events WHERE verified = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(GlobalRollup {
            total_kg: total,
            event_count: count,
            updated_at: last.unwrap_or(0),
        }))
    }

    fn leaderboard(
        &self,
        conn: &Connection,
        period: Period,
        scope: &Scope,
        limit: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Vec<LeaderboardEntry>>> {
        let mut sql = "SELECT actor_id, ROUND(SUM(quantity_kg), 4) AS total_kg, MAX(verified_at)
             FROM action_events WHERE verified = 1"
            .to_string();
        let mut bind: Vec<String> = Vec::new();

        match period {
            Period::AllTime => {}
            Period::Monthly | Period::Weekly => {
                bind.push(as_of.format("%Y-%m").to_string());
                sql.push_str(&format!(
                    " AND strftime('%Y-%m', verified_at, 'unixepoch') = ?{}",
                    bind.len()
                ));
            }
            Period::Yearly => {
                bind.push(as_of.format("%Y").to_string());
                sql.push_str(&format!(
                    " AND strftime('%Y', verified_at, 'unixepoch') = ?{}",
                    bind.len()
                ));
            }
        }

        if let Scope::Actors(actors) = scope {
            if actors.is_empty() {
                return Ok(None);
            }
            let placeholders: Vec<String> = (0..actors.len())
                .map(|i| format!("?{}", bind.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND actor_id IN ({})", placeholders.join(", ")));
            bind.extend(actors.iter().cloned());
        }

        sql.push_str(" GROUP BY actor_id HAVING total_kg > 0");

        let divisor = if period == Period::Weekly { 4.0 } else { 1.0 };

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(bind.iter()), |row| {
                Ok(RankedValue {
                    actor_id: row.get(0)?,
                    display_name: None,
                    value_kg: row.get::<_, f64>(1)?,
                    last_verified_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Ok(None);
        }
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.value_kg = crate::tracker::units::round4(r.value_kg / divisor);
                r
            })
            .collect();
        Ok(Some(order_and_rank(rows, period, limit, as_of)))
    }

    fn recent_events(
        &self,
        _conn: &Connection,
        _actor_id: Option<&str>,
        _limit: usize,
    ) -> Result<Option<Vec<EventSummary>>> {
        // The event log is itself the source of record for recent events;
        // the current generation already reads it directly.
        Ok(None)
    }
}

/// Shared newest-first event query across generations with differing
/// column names
fn query_event_summaries(
    conn: &Connection,
    table: &str,
    cols: (&str, &str, &str, &str, &str),
    actor_id: Option<&str>,
    limit: usize,
) -> Result<Vec<EventSummary>> {
    let (id_col, actor_col, qty_col, verified_col, created_col) = cols;
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
            let sql = format!(
                "SELECT {id}, {actor}, {qty}, {verified}, {created} FROM {table}
                 WHERE {actor} = ?1 ORDER BY {created} DESC LIMIT ?2",
                id = id_col,
                actor = actor_col,
                qty = qty_col,
                verified = verified_col,
                created = created_col,
                table = table,
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![actor, limit as i64], map_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let sql = format!(
                "SELECT {id}, {actor}, {qty}, {verified}, {created} FROM {table}
                 ORDER BY {created} DESC LIMIT ?1",
                id = id_col,
                actor = actor_col,
                qty = qty_col,
                verified = verified_col,
                created = created_col,
                table = table,
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], map_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(events)
}
