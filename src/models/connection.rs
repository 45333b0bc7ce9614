//! Connection state tracked per account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Platform;

/// Connector state machine: Disconnected -> Connecting -> Connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "connecting" => Some(ConnectionStatus::Connecting),
            "connected" => Some(ConnectionStatus::Connected),
            _ => None,
        }
    }
}

/// One row per account, upserted exclusively by connector lifecycle handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub account_id: i64,
    pub platform: Platform,
    pub status: ConnectionStatus,
    pub server: Option<String>,
    pub account_label: Option<String>,
    pub last_ping_ms: Option<i64>,
    pub last_update: DateTime<Utc>,
}
