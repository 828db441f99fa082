//! Savings aggregation engine: event log, incremental rollups, periodic
//! reconciliation, leaderboard ranking, and the multi-generation read path.

pub mod aggregator;
pub mod db;
pub mod event_store;
pub mod leaderboard;
pub mod read_adapter;
pub mod reconciler;
pub mod units;

pub use db::SavingsDb;
pub use event_store::EventStore;
pub use leaderboard::Ranker;
pub use read_adapter::ReadAdapter;
pub use reconciler::{Reconciler, EPSILON_KG};
pub use units::MassUnit;
