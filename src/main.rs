//! GreenLedger - Community Carbon Savings Tracker
//!
//! Tracks verified carbon-saving actions per actor, maintains incremental
//! per-actor and global rollups, reconciles them on a schedule, and serves
//! ranked leaderboards over HTTP.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use greenledger_backend::api::{create_router, AppState};
use greenledger_backend::models::Config;
use greenledger_backend::tracker::{EventStore, ReadAdapter, Reconciler, SavingsDb};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!("🌍 Starting GreenLedger backend");

    let db = SavingsDb::open(&config.database_path)?;
    let events = EventStore::new(db.clone());
    let reconciler = Reconciler::new(db.clone());
    let reads = Arc::new(ReadAdapter::new(db.clone()));

    // Scheduled reconciliation; the endpoint can also trigger it on demand
    tokio::spawn(reconcile_polling(
        reconciler.clone(),
        config.reconcile_interval_secs,
    ));

    let state = AppState {
        events,
        reconciler,
        reads,
        max_leaderboard_limit: config.max_leaderboard_limit,
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Periodic reconciliation loop. A failed pass is logged and retried on the
/// next tick; drift left behind by one pass converges on the next.
async fn reconcile_polling(reconciler: Reconciler, interval_secs: u64) {
    info!(
        "🕐 Starting scheduled reconciliation (every {}s)",
        interval_secs
    );

    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match reconciler.reconcile() {
            Ok(record) if record.fixed => {
                warn!(
                    "🛠️  Scheduled reconcile repaired drift of {} kg",
                    record.discrepancy_kg
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!("⚠️  Scheduled reconcile failed (non-critical): {}", e);
            }
        }
    }
}

/// Initialize tracing with env-filter overrides
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "greenledger_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
