//! GreenLedger Admin Tool
//!
//! Operational CLI against a tracker database: run a reconciliation pass,
//! inspect the audit trail, and dump rollups or the current leaderboard.
//!
//! Usage:
//!   cargo run --bin greenledger-admin -- --db-path ./greenledger.db reconcile
//!   cargo run --bin greenledger-admin -- --db-path ./greenledger.db audits --limit 10
//!   cargo run --bin greenledger-admin -- --db-path ./greenledger.db board --period monthly

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use greenledger_backend::models::{Period, Scope};
use greenledger_backend::tracker::{Ranker, ReadAdapter, Reconciler, SavingsDb};

/// Operational tool for the GreenLedger savings database
#[derive(Parser, Debug)]
#[command(name = "greenledger-admin")]
#[command(about = "Inspect and repair a GreenLedger savings database")]
struct Cli {
    /// Path to the SQLite database
    #[arg(short, long, default_value = "./greenledger.db")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass and print its audit record
    Reconcile,

    /// Show the reconciliation audit trail, newest first
    Audits {
        /// Number of records to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the global rollup
    Global,

    /// Show one actor's rollup
    Actor {
        /// Actor id to inspect
        actor_id: String,
    },

    /// Show the current-generation leaderboard
    Board {
        /// Period: all_time, yearly, monthly, weekly
        #[arg(short, long, default_value = "all_time")]
        period: String,

        /// Number of entries
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let db = SavingsDb::open(&cli.db_path)?;

    match cli.command {
        Commands::Reconcile => {
            let record = Reconciler::new(db).reconcile()?;
            if record.was_in_sync {
                println!(
                    "In sync: actor sum {} kg, global {} kg (discrepancy {} kg)",
                    record.actor_sum_kg, record.global_kg, record.discrepancy_kg
                );
            } else {
                println!(
                    "Drift repaired: global {} kg -> {} kg (discrepancy {} kg)",
                    record.global_kg, record.actor_sum_kg, record.discrepancy_kg
                );
            }
            println!("Audit record: {}", record.id);
        }

        Commands::Audits { limit } => {
            let audits = Reconciler::new(db).list_audits(limit)?;
            if audits.is_empty() {
                println!("No reconciliation passes recorded");
            }
            for a in audits {
                println!(
                    "{} ts={} actor_sum={} global={} discrepancy={} in_sync={} fixed={}",
                    a.id, a.ts, a.actor_sum_kg, a.global_kg, a.discrepancy_kg, a.was_in_sync,
                    a.fixed
                );
            }
        }

        Commands::Global => {
            let rollup = ReadAdapter::new(db).global_rollup()?;
            println!(
                "Global: {} kg across {} verified events (updated_at={})",
                rollup.total_kg, rollup.event_count, rollup.updated_at
            );
        }

        Commands::Actor { actor_id } => match ReadAdapter::new(db).actor_rollup(&actor_id)? {
            Some(rollup) => println!(
                "{}: {} kg across {} verified events (last_verified_at={:?})",
                rollup.actor_id, rollup.total_kg, rollup.event_count, rollup.last_verified_at
            ),
            None => println!("{}: no verified savings in any generation", actor_id),
        },

        Commands::Board { period, limit } => {
            let Some(period) = Period::from_str(&period) else {
                bail!("unknown period: {} (expected all_time, yearly, monthly, weekly)", period);
            };
            let entries = Ranker::new(db).rank(period, &Scope::Global, limit)?;
            if entries.is_empty() {
                println!("Leaderboard is empty for {}", period.as_str());
            }
            for e in entries {
                println!("#{:<3} {:<24} {:>12.4} kg", e.rank, e.display_name, e.savings_kg);
            }
        }
    }

    Ok(())
}
