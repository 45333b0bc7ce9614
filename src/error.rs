//! Error taxonomy for the replication engine.
//!
//! Connection-lifecycle errors surface as a `Disconnected` transition plus a
//! broadcast event; execution errors are caught per-account inside the fan-out
//! and become FAILED audit rows. Neither aborts sibling accounts.

use thiserror::Error;

/// Connection lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid credentials for {server}")]
    InvalidCredentials { server: String },

    #[error("venue unreachable: {0}")]
    VenueUnreachable(String),

    #[error("reconnect attempt ceiling ({0}) exhausted")]
    AttemptsExhausted(u32),

    #[error("invalid connection state: {0}")]
    InvalidState(String),
}

/// The venue rejected an order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("insufficient margin")]
    InsufficientMargin,

    #[error("market closed for {symbol}")]
    MarketClosed { symbol: String },

    #[error("slippage exceeded {max_points} points")]
    SlippageExceeded { max_points: i64 },

    #[error("not connected to venue")]
    NotConnected,

    #[error("order rejected: {0}")]
    Rejected(String),
}

/// Risk adjustment rejected the order outright.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("risk multiplier {0} outside valid range (0, 10]")]
    MultiplierOutOfRange(rust_decimal::Decimal),
}

/// Account/configuration-level failures from the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("configuration incomplete for account {0}")]
    ConfigIncomplete(i64),

    #[error("ambiguous master configuration: {0} active master accounts")]
    AmbiguousMaster(usize),

    #[error("risk multiplier {0} outside valid range (0, 10]")]
    InvalidRiskMultiplier(rust_decimal::Decimal),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Error message recorded on audit rows for conflict-blocked replications.
/// Kept distinguishable from venue failures for auditability.
pub const CONFLICT_BLOCKED_MESSAGE: &str = "blocked: manual trading active on account";
