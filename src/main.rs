//! Trade replication engine
//!
//! Observes trades on a single master account and replicates them, volume-
//! scaled per account, to any number of slave accounts across brokerage
//! platforms. Ships a REST + WebSocket surface for the dashboard.

mod api;
mod broadcast;
mod conflict;
mod connector;
mod db;
mod dispatcher;
mod engine;
mod error;
mod models;
mod registry;
mod risk;
mod stats;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{create_router, AppState};
use crate::conflict::{Decision, DEFAULT_WINDOW_SECS};
use crate::connector::SimulationProfile;
use crate::db::Database;
use crate::engine::Engine;

/// Trade replication engine CLI.
#[derive(Parser)]
#[command(name = "trademirror")]
#[command(about = "Replicate trades from a master account to slave accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./trademirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication engine and API server
    Serve {
        /// Address to bind the API server on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Use a failure-free simulated venue (for demos)
        #[arg(long)]
        reliable: bool,
    },

    /// List configured accounts
    Accounts,

    /// Show today's stats and the connection table
    Status,

    /// Report a manual trade against an account and show the conflict
    /// decision its policy produces
    SimulateManual {
        /// Account id
        account: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Arc::new(Database::new(&cli.database).await?);

    match cli.command {
        Commands::Serve { bind, reliable } => {
            let profile = if reliable {
                SimulationProfile::reliable()
            } else {
                SimulationProfile::default()
            };

            let engine = Engine::new(Arc::clone(&db), profile).await?;
            engine.start().await?;

            let app = create_router(AppState::new(Arc::clone(&engine)));
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!(bind = %bind, "API server listening");

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutdown signal received");
                })
                .await?;

            engine.shutdown().await;
        }

        Commands::Accounts => {
            let accounts = db.list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts configured. Use the API to add one.");
                return Ok(());
            }

            println!(
                "\n{:<5} {:<20} {:<16} {:<7} {:<7} {:>6} {:<18}",
                "ID", "NAME", "PLATFORM", "MASTER", "ACTIVE", "RISK", "CONFLICT POLICY"
            );
            println!("{}", "-".repeat(84));
            for account in accounts {
                println!(
                    "{:<5} {:<20} {:<16} {:<7} {:<7} {:>6} {:<18}",
                    account.id,
                    truncate(&account.name, 18),
                    account.platform.as_str(),
                    if account.is_master { "yes" } else { "no" },
                    if account.is_active { "yes" } else { "no" },
                    account.risk_multiplier.to_string(),
                    account.conflict_policy.as_str(),
                );
            }
        }

        Commands::Status => {
            let today = Utc::now().date_naive();
            let stats = db
                .get_daily_stats(today)
                .await?
                .unwrap_or_else(|| crate::models::DailyStats::empty(today));

            println!("\n=== Stats for {} ===", today);
            println!("Trades:      {}", stats.trades_count);
            println!("Successful:  {}", stats.successful_trades);
            println!("Failed:      {}", stats.failed_trades);
            println!("Avg latency: {} ms", stats.avg_latency_ms);

            let connections = db.list_connections().await?;
            if connections.is_empty() {
                println!("\nNo connections recorded.");
                return Ok(());
            }

            println!(
                "\n{:<8} {:<16} {:<13} {:<24} {:>8}",
                "ACCOUNT", "PLATFORM", "STATUS", "SERVER", "PING"
            );
            println!("{}", "-".repeat(74));
            for connection in connections {
                println!(
                    "{:<8} {:<16} {:<13} {:<24} {:>8}",
                    connection.account_id,
                    connection.platform.as_str(),
                    connection.status.as_str(),
                    truncate(connection.server.as_deref().unwrap_or("-"), 22),
                    connection
                        .last_ping_ms
                        .map(|ms| format!("{ms} ms"))
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }

        Commands::SimulateManual { account } => {
            let engine = Engine::new(Arc::clone(&db), SimulationProfile::reliable()).await?;
            let target = engine.registry().get_account(account).await?;

            engine.report_manual_trade(account).await?;
            let decision = engine.conflict_decision(account).await?;

            println!(
                "Manual trade reported on account {} ({})",
                target.id, target.name
            );
            println!("Conflict policy: {}", target.conflict_policy.as_str());
            println!(
                "Replications within the next {} s would be: {}",
                DEFAULT_WINDOW_SECS,
                match decision {
                    Decision::Proceed => "replicated normally",
                    Decision::Queued => "queued until the window elapses",
                    Decision::Blocked => "blocked and recorded as failed",
                }
            );
        }
    }

    Ok(())
}

/// Shorten to at most `max` characters, counting chars rather than bytes so
/// multibyte names never split mid-character.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}
