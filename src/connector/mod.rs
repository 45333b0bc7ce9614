//! Platform connectors: per-account connection lifecycle and order execution.
//!
//! The core depends only on the [`PlatformConnector`] trait. The shipped
//! implementation simulates the venue (the real terminal protocols are a
//! separate integration); tests use deterministic fakes.

mod simulated;

pub use simulated::{SimulatedConnector, SimulationProfile};

use async_trait::async_trait;

use crate::error::{ConnectionError, ExecutionError};
use crate::models::{AdjustedOrder, ConnectionStatus, Credentials, ExecutionReceipt, MasterTrade};

/// Consecutive reconnect failures tolerated before the connector reports
/// terminal failure and stops touching the venue.
pub const RECONNECT_CEILING: u32 = 5;

/// Identifying details returned by a successful connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub server: String,
    pub account_label: String,
}

/// Asynchronous notifications from connectors, consumed by the engine over a
/// single typed mpsc channel. `Trade` is only ever emitted by the master
/// account's connector.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Connected {
        account_id: i64,
        handle: ConnectionHandle,
    },
    Disconnected {
        account_id: i64,
    },
    Ping {
        account_id: i64,
        latency_ms: u64,
    },
    ConnectionLost {
        account_id: i64,
    },
    Trade {
        trade: MasterTrade,
    },
}

/// Connection lifecycle and execution against one external venue.
///
/// State machine: Disconnected -> Connecting -> Connected; Connecting falls
/// back to Disconnected on failure, Connected falls back on explicit
/// disconnect or probe failure. `reconnect` is only valid from Disconnected.
/// Execution failures are never retried here; retry policy belongs to the
/// dispatcher.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle, ConnectionError>;

    async fn disconnect(&self);

    /// Bounded retry: fails immediately with `AttemptsExhausted` once
    /// [`RECONNECT_CEILING`] consecutive attempts have failed. The caller must
    /// invoke again to retry past that point.
    async fn reconnect(&self) -> Result<ConnectionHandle, ConnectionError>;

    async fn execute_order(&self, order: &AdjustedOrder)
        -> Result<ExecutionReceipt, ExecutionError>;

    /// Liveness probe; measures round-trip latency in milliseconds. A failed
    /// probe transitions the connector to Disconnected and emits
    /// `ConnectionLost`; this is the sole automatic failure detector.
    async fn ping(&self) -> Result<u64, ConnectionError>;

    fn status(&self) -> ConnectionStatus;
}
