//! Running daily statistics, updated after every replication attempt.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::Database;
use crate::models::DailyStats;

/// Incremental per-day counters backed by the `daily_stats` table.
///
/// All updates go through a single mutex so the cumulative-average formula is
/// applied atomically per day-key; the row is upserted after each update and
/// never recomputed from the audit log.
pub struct StatsAggregator {
    db: Arc<Database>,
    days: Mutex<HashMap<NaiveDate, DailyStats>>,
}

impl StatsAggregator {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            days: Mutex::new(HashMap::new()),
        }
    }

    /// Record one replication outcome. The latency only feeds the running
    /// mean when the attempt succeeded:
    /// `avg' = round((avg * old_successes + latency) / new_successes)`.
    pub async fn record(&self, date: NaiveDate, success: bool, latency_ms: i64) -> Result<DailyStats> {
        let mut days = self.days.lock().await;

        let stats = match days.entry(date) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                // First update of the day in this process: resume from the
                // store if a row already exists.
                let existing = self
                    .db
                    .get_daily_stats(date)
                    .await?
                    .unwrap_or_else(|| DailyStats::empty(date));
                entry.insert(existing)
            }
        };

        stats.trades_count += 1;
        if success {
            let old_successes = stats.successful_trades;
            let new_successes = old_successes + 1;
            stats.avg_latency_ms = ((stats.avg_latency_ms * old_successes + latency_ms) as f64
                / new_successes as f64)
                .round() as i64;
            stats.successful_trades = new_successes;
        } else {
            stats.failed_trades += 1;
        }

        debug!(
            date = %date,
            trades = stats.trades_count,
            successful = stats.successful_trades,
            failed = stats.failed_trades,
            avg_latency_ms = stats.avg_latency_ms,
            "Stats updated"
        );

        self.db.upsert_daily_stats(stats).await?;
        Ok(stats.clone())
    }

    /// Stats for one day, preferring the in-memory state over the store.
    pub async fn for_date(&self, date: NaiveDate) -> Result<DailyStats> {
        let days = self.days.lock().await;
        if let Some(stats) = days.get(&date) {
            return Ok(stats.clone());
        }
        drop(days);

        Ok(self
            .db
            .get_daily_stats(date)
            .await?
            .unwrap_or_else(|| DailyStats::empty(date)))
    }
}
