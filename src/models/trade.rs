//! Trade models: observed master trades, adjusted slave orders, and the
//! append-only replication audit record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// A trade observed on the master account. Immutable once observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterTrade {
    /// Instrument symbol, e.g. "EURUSD"
    pub symbol: String,

    pub side: TradeSide,

    /// Lot volume on the master account
    pub volume: Decimal,

    pub price: Decimal,

    /// When the trade occurred on the master terminal
    pub occurred_at: DateTime<Utc>,
}

/// A master trade after per-account risk adjustment, ready for execution
/// against a slave account's venue.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustedOrder {
    pub symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    /// Trailing stop in points, interpreted by the execution venue
    pub trailing_stop: Option<i64>,
    /// Maximum tolerated slippage in points
    pub max_slippage: i64,
}

/// Receipt returned by a venue for an executed order.
#[derive(Debug, Clone)]
pub struct ExecutionReceipt {
    pub order_id: String,
    pub executed_price: Decimal,
}

/// Outcome of one replication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Success,
    Failed,
    Pending,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Success => "SUCCESS",
            TradeStatus::Failed => "FAILED",
            TradeStatus::Pending => "PENDING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(TradeStatus::Success),
            "FAILED" => Some(TradeStatus::Failed),
            "PENDING" => Some(TradeStatus::Pending),
            _ => None,
        }
    }
}

/// One row of the replication audit log: one per fan-out attempt per account,
/// plus one for the originating master trade (`account_id` = None).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedTrade {
    pub id: String,
    pub account_id: Option<i64>,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub status: TradeStatus,
    pub latency_ms: Option<i64>,
    pub source_platform: String,
    pub target_platform: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
