use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Leaderboard periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    AllTime,
    Yearly,
    Monthly,
    /// Not tracked as its own bucket: served as the monthly value / 4.
    Weekly,
}

impl Period {
    pub fn as_str(&self) -> &str {
        match self {
            Period::AllTime => "all_time",
            Period::Yearly => "yearly",
            Period::Monthly => "monthly",
            Period::Weekly => "weekly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "all_time" => Some(Period::AllTime),
            "yearly" => Some(Period::Yearly),
            "monthly" => Some(Period::Monthly),
            "weekly" => Some(Period::Weekly),
            _ => None,
        }
    }
}

/// Leaderboard scope. Friend/team membership is resolved by the identity
/// service, so a non-global scope arrives as an explicit actor-id subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Actors(Vec<String>),
}

/// One submitted action with its verification state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEvent {
    pub id: String,
    pub actor_id: String,
    pub quantity_kg: f64,
    pub verified: bool,
    pub created_at: i64,
    pub verified_at: Option<i64>,
}

/// Compact event view for the recent-activity feed (newest first)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub actor_id: String,
    pub quantity_kg: f64,
    pub verified: bool,
    pub created_at: i64,
}

/// Per-actor running totals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRollup {
    pub actor_id: String,
    pub total_kg: f64,
    pub event_count: i64,
    pub last_verified_at: Option<i64>,
    pub updated_at: i64,
}

/// System-wide running totals (singleton)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRollup {
    pub total_kg: f64,
    pub event_count: i64,
    pub updated_at: i64,
}

/// One reconciliation pass, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub ts: i64,
    pub actor_sum_kg: f64,
    pub global_kg: f64,
    pub discrepancy_kg: f64,
    pub was_in_sync: bool,
    pub fixed: bool,
    pub detail: Option<String>,
}

/// Derived leaderboard row (never stored)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub actor_id: String,
    pub display_name: String,
    pub savings_kg: f64,
    pub period: Period,
    pub as_of: DateTime<Utc>,
}

/// Outcome of a verification call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    Verified,
    /// Repeat delivery from the verification service; no state change.
    AlreadyVerified,
}

// ===== Error Taxonomy =====

/// Engine errors. Storage plumbing stays on anyhow; this enum is the
/// caller-facing taxonomy for the write paths.
#[derive(Debug)]
pub enum TrackerError {
    InvalidInput(String),
    NotFound(String),
    /// A concurrent-update race detected by the storage layer; the whole
    /// atomic unit was rolled back and retried before this surfaced.
    Conflict(String),
    Storage(anyhow::Error),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            TrackerError::NotFound(msg) => write!(f, "not found: {}", msg),
            TrackerError::Conflict(msg) => write!(f, "conflict: {}", msg),
            TrackerError::Storage(err) => write!(f, "storage error: {}", err),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<anyhow::Error> for TrackerError {
    fn from(err: anyhow::Error) -> Self {
        TrackerError::Storage(err)
    }
}

impl From<rusqlite::Error> for TrackerError {
    fn from(err: rusqlite::Error) -> Self {
        TrackerError::Storage(err.into())
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

// ===== Configuration =====

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub reconcile_interval_secs: u64,
    pub max_leaderboard_limit: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./greenledger.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let reconcile_interval_secs = std::env::var("RECONCILE_INTERVAL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);

        let max_leaderboard_limit = std::env::var("MAX_LEADERBOARD_LIMIT")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        Ok(Self {
            database_path,
            port,
            reconcile_interval_secs,
            max_leaderboard_limit,
        })
    }
}
