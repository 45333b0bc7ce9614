//! Domain models shared across the replication engine.

mod account;
mod connection;
mod feature;
mod stats;
mod trade;

pub use account::{Account, AccountConfiguration, ConflictPolicy, Credentials, Platform};
pub use connection::{Connection, ConnectionStatus};
pub use feature::FeatureConfig;
pub use stats::DailyStats;
pub use trade::{
    AdjustedOrder, ExecutionReceipt, MasterTrade, ReplicatedTrade, TradeSide, TradeStatus,
};
