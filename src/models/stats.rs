//! Daily replication statistics.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One row per day, mutated incrementally and never recomputed from scratch
/// after the first write of the day.
///
/// `successful_trades + failed_trades == trades_count` holds at every
/// observable point; `avg_latency_ms` reflects only successful trades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub trades_count: i64,
    pub successful_trades: i64,
    pub failed_trades: i64,
    pub avg_latency_ms: i64,
}

impl DailyStats {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            trades_count: 0,
            successful_trades: 0,
            failed_trades: 0,
            avg_latency_ms: 0,
        }
    }
}
