//! Leaderboard ranking over the rollup tables.
//!
//! Ordering is a total order: scoped value descending, then most recent
//! verified-event timestamp descending (the more recently active actor wins
//! an exact tie), then actor id ascending as the final key. Ranks are dense,
//! 1-based, assigned after the full sort; `limit` truncates afterwards so it
//! can never change how a tie resolves.
//!
//! There is no weekly bucket: the weekly board is the monthly value / 4, a
//! deliberate approximation carried over from the product's history.

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection};

use crate::models::{LeaderboardEntry, Period, Scope, TrackerResult};
use crate::tracker::aggregator::{month_label, year_label, PERIOD_KIND_MONTH, PERIOD_KIND_YEAR};
use crate::tracker::db::SavingsDb;
use crate::tracker::units::round4;

/// One actor's scoped value before ordering
#[derive(Debug, Clone)]
pub(crate) struct RankedValue {
    pub actor_id: String,
    pub display_name: Option<String>,
    pub value_kg: f64,
    pub last_verified_at: Option<i64>,
}

/// Sort, truncate, and assign dense ranks. Shared with the read adapter's
/// recompute fallback so every path breaks ties identically.
pub(crate) fn order_and_rank(
    mut rows: Vec<RankedValue>,
    period: Period,
    limit: usize,
    as_of: DateTime<Utc>,
) -> Vec<LeaderboardEntry> {
    rows.sort_by(|a, b| {
        b.value_kg
            .partial_cmp(&a.value_kg)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.last_verified_at.cmp(&a.last_verified_at))
            .then_with(|| a.actor_id.cmp(&b.actor_id))
    });
    rows.truncate(limit);

    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| LeaderboardEntry {
            rank: idx + 1,
            display_name: row
                .display_name
                .unwrap_or_else(|| row.actor_id.clone()),
            actor_id: row.actor_id,
            savings_kg: row.value_kg,
            period,
            as_of,
        })
        .collect()
}

/// Ranker over the current-generation rollup tables
#[derive(Clone)]
pub struct Ranker {
    db: SavingsDb,
}

impl Ranker {
    pub fn new(db: SavingsDb) -> Self {
        Self { db }
    }

    /// Rank actors for a period and scope, best first
    pub fn rank(
        &self,
        period: Period,
        scope: &Scope,
        limit: usize,
    ) -> TrackerResult<Vec<LeaderboardEntry>> {
        let as_of = Utc::now();
        let rows = fetch_values(&self.db.conn(), period, scope, as_of)?;
        Ok(order_and_rank(rows, period, limit, as_of))
    }
}

/// Fetch every eligible actor's scoped value, unordered and unbounded.
/// The limit is applied only after the full sort in `order_and_rank`.
pub(crate) fn fetch_values(
    conn: &Connection,
    period: Period,
    scope: &Scope,
    as_of: DateTime<Utc>,
) -> TrackerResult<Vec<RankedValue>> {
    let mut bind: Vec<String> = Vec::new();

    let mut sql = match period {
        Period::AllTime => {
            "SELECT r.actor_id, p.display_name, r.total_kg, r.last_verified_at
             FROM actor_rollups r
             LEFT JOIN actor_profiles p ON p.actor_id = r.actor_id
             WHERE r.total_kg > 0"
                .to_string()
        }
        Period::Yearly | Period::Monthly | Period::Weekly => {
            let (kind, label) = period_bucket(period, as_of);
            bind.push(kind.to_string());
            bind.push(label);
            "SELECT pr.actor_id, p.display_name, pr.total_kg, r.last_verified_at
             FROM period_rollups pr
             JOIN actor_rollups r ON r.actor_id = pr.actor_id
             LEFT JOIN actor_profiles p ON p.actor_id = pr.actor_id
             WHERE pr.period_kind = ?1 AND pr.period_label = ?2 AND pr.total_kg > 0"
                .to_string()
        }
    };

    if let Scope::Actors(actors) = scope {
        if actors.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (0..actors.len())
            .map(|i| format!("?{}", bind.len() + i + 1))
            .collect();
        sql.push_str(&format!(
            " AND {}.actor_id IN ({})",
            if period == Period::AllTime { "r" } else { "pr" },
            placeholders.join(", ")
        ));
        bind.extend(actors.iter().cloned());
    }

    let divisor = if period == Period::Weekly { 4.0 } else { 1.0 };

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind.iter()), |row| {
            Ok(RankedValue {
                actor_id: row.get(0)?,
                display_name: row.get(1)?,
                value_kg: row.get(2)?,
                last_verified_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .map(|mut r| {
            r.value_kg = round4(r.value_kg / divisor);
            r
        })
        .collect())
}

/// Bucket key for a non-all-time period, as of `now`. Weekly reads the
/// monthly bucket (the / 4 happens on the value, not the key).
fn period_bucket(period: Period, now: DateTime<Utc>) -> (&'static str, String) {
    match period {
        Period::Monthly | Period::Weekly => (PERIOD_KIND_MONTH, month_label(now)),
        Period::Yearly => (PERIOD_KIND_YEAR, year_label(now)),
        Period::AllTime => unreachable!("all_time has no bucket"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::event_store::EventStore;
    use crate::tracker::units::MassUnit;
    use rusqlite::params;
    use tempfile::NamedTempFile;

    fn create_test_env() -> (EventStore, Ranker, SavingsDb, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let db = SavingsDb::open(temp.path().to_str().unwrap()).unwrap();
        (EventStore::new(db.clone()), Ranker::new(db.clone()), db, temp)
    }

    fn verify_appended(store: &EventStore, actor: &str, kg: f64) {
        let id = store.append(actor, kg, MassUnit::Kilograms).unwrap();
        store.mark_verified(&id).unwrap();
    }

    /// Force a known last_verified_at so recency tie-breaks are testable
    fn set_last_verified(db: &SavingsDb, actor: &str, ts: i64) {
        db.conn()
            .execute(
                "UPDATE actor_rollups SET last_verified_at = ?2 WHERE actor_id = ?1",
                params![actor, ts],
            )
            .unwrap();
    }

    #[test]
    fn test_rank_orders_by_value() {
        let (store, ranker, _db, _temp) = create_test_env();
        verify_appended(&store, "small", 1.0);
        verify_appended(&store, "big", 10.0);
        verify_appended(&store, "mid", 5.0);

        let board = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        let ids: Vec<&str> = board.iter().map(|e| e.actor_id.as_str()).collect();
        assert_eq!(ids, vec!["big", "mid", "small"]);
        let ranks: Vec<usize> = board.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn test_exact_tie_broken_by_recency() {
        let (store, ranker, db, _temp) = create_test_env();
        verify_appended(&store, "actor-a", 10.0);
        verify_appended(&store, "actor-b", 10.0);
        set_last_verified(&db, "actor-a", 1_000);
        set_last_verified(&db, "actor-b", 2_000); // more recent

        let board = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        assert_eq!(board[0].actor_id, "actor-b");
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].actor_id, "actor-a");
        assert_eq!(board[1].rank, 2);
    }

    #[test]
    fn test_rank_is_deterministic_across_calls() {
        let (store, ranker, db, _temp) = create_test_env();
        for actor in ["a1", "a2", "a3", "a4"] {
            verify_appended(&store, actor, 10.0);
        }
        // Identical values and timestamps: final key (actor id) decides
        for actor in ["a1", "a2", "a3", "a4"] {
            set_last_verified(&db, actor, 5_000);
        }

        let first = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        let second = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.actor_id.clone()).collect();
        let ids2: Vec<_> = second.iter().map(|e| e.actor_id.clone()).collect();
        assert_eq!(ids, ids2);
        assert_eq!(ids, vec!["a1", "a2", "a3", "a4"]);
    }

    #[test]
    fn test_ranks_contiguous_no_shared_ranks_on_ties() {
        let (store, ranker, _db, _temp) = create_test_env();
        verify_appended(&store, "a", 5.0);
        verify_appended(&store, "b", 5.0);
        verify_appended(&store, "c", 5.0);
        verify_appended(&store, "d", 1.0);

        let board = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        let ranks: Vec<usize> = board.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_limit_truncates_after_full_ordering() {
        let (store, ranker, db, _temp) = create_test_env();
        verify_appended(&store, "a", 5.0);
        verify_appended(&store, "b", 5.0);
        verify_appended(&store, "c", 5.0);
        // c is most recent, then b, then a: limit 2 must pick c then b
        set_last_verified(&db, "a", 100);
        set_last_verified(&db, "b", 200);
        set_last_verified(&db, "c", 300);

        let board = ranker.rank(Period::AllTime, &Scope::Global, 2).unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].actor_id, "c");
        assert_eq!(board[1].actor_id, "b");
    }

    #[test]
    fn test_zero_value_actors_excluded() {
        let (store, ranker, db, _temp) = create_test_env();
        verify_appended(&store, "a", 5.0);
        db.conn()
            .execute(
                "INSERT INTO actor_rollups (actor_id, total_kg, event_count, updated_at)
                 VALUES ('idle', 0, 0, 0)",
                [],
            )
            .unwrap();

        let board = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].actor_id, "a");
    }

    #[test]
    fn test_monthly_and_weekly_approximation() {
        let (store, ranker, _db, _temp) = create_test_env();
        verify_appended(&store, "a", 8.0);

        let monthly = ranker.rank(Period::Monthly, &Scope::Global, 10).unwrap();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].savings_kg, 8.0);

        // Weekly is served as monthly / 4
        let weekly = ranker.rank(Period::Weekly, &Scope::Global, 10).unwrap();
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].savings_kg, 2.0);
    }

    #[test]
    fn test_actor_subset_scope() {
        let (store, ranker, _db, _temp) = create_test_env();
        verify_appended(&store, "a", 5.0);
        verify_appended(&store, "b", 4.0);
        verify_appended(&store, "c", 3.0);

        let scope = Scope::Actors(vec!["b".to_string(), "c".to_string()]);
        let board = ranker.rank(Period::AllTime, &scope, 10).unwrap();
        let ids: Vec<&str> = board.iter().map(|e| e.actor_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(board[0].rank, 1);

        let empty = ranker
            .rank(Period::AllTime, &Scope::Actors(Vec::new()), 10)
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_display_name_from_profile() {
        let (store, ranker, _db, _temp) = create_test_env();
        verify_appended(&store, "a", 5.0);
        store.upsert_profile("a", "Alice").unwrap();

        let board = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        assert_eq!(board[0].display_name, "Alice");

        // No profile: actor id stands in
        verify_appended(&store, "b", 6.0);
        let board = ranker.rank(Period::AllTime, &Scope::Global, 10).unwrap();
        assert_eq!(board[0].display_name, "b");
    }
}
