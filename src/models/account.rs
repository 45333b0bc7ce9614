//! Accounts and their per-account connection configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading platform an account lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// MT4/MT5-style terminal (server + login + password)
    MetaTrader,
    /// REST/API-keyed brokerage
    ApiBroker,
    /// Charting-platform bridge
    ChartingBridge,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::MetaTrader => "metatrader",
            Platform::ApiBroker => "api_broker",
            Platform::ChartingBridge => "charting_bridge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metatrader" => Some(Platform::MetaTrader),
            "api_broker" => Some(Platform::ApiBroker),
            "charting_bridge" => Some(Platform::ChartingBridge),
            _ => None,
        }
    }
}

/// What to do when manual trading is detected on a slave account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Queue replications until the conflict window elapses
    PauseReplication,
    /// Drop the replication and record it as a failure
    BlockManual,
    /// Replicate regardless of manual activity
    AllowBoth,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::PauseReplication => "pause_replication",
            ConflictPolicy::BlockManual => "block_manual",
            ConflictPolicy::AllowBoth => "allow_both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pause_replication" => Some(ConflictPolicy::PauseReplication),
            "block_manual" => Some(ConflictPolicy::BlockManual),
            "allow_both" => Some(ConflictPolicy::AllowBoth),
            _ => None,
        }
    }
}

/// A configured trading account: one master, any number of slaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,

    pub name: String,

    pub platform: Platform,

    /// The account whose trades are observed and replicated outward
    pub is_master: bool,

    pub is_active: bool,

    /// Scalar applied to master volume before execution, must lie in (0, 10]
    pub risk_multiplier: Decimal,

    pub conflict_policy: ConflictPolicy,

    pub allow_manual_trading: bool,
}

/// Connection credentials and risk settings for one account.
///
/// Fields are optional because the configuration surface can save partial
/// drafts; an incomplete configuration excludes the account from connection
/// attempts and from replication fan-out entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfiguration {
    pub account_id: i64,
    pub server: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl AccountConfiguration {
    /// Whether every credential field the platform requires is present.
    pub fn is_complete(&self, platform: Platform) -> bool {
        match platform {
            Platform::MetaTrader => {
                self.server.is_some() && self.login.is_some() && self.password.is_some()
            }
            Platform::ApiBroker => self.api_key.is_some() && self.api_secret.is_some(),
            Platform::ChartingBridge => self.server.is_some() && self.api_key.is_some(),
        }
    }

    /// Materialize credentials for a connection attempt, or `None` when the
    /// configuration is still incomplete for the platform.
    pub fn credentials(&self, platform: Platform) -> Option<Credentials> {
        if !self.is_complete(platform) {
            return None;
        }
        Some(Credentials {
            server: self.server.clone().unwrap_or_default(),
            login: self.login.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            api_key: self.api_key.clone().unwrap_or_default(),
            api_secret: self.api_secret.clone().unwrap_or_default(),
        })
    }
}

/// Complete credentials handed to a connector.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub server: String,
    pub login: String,
    pub password: String,
    pub api_key: String,
    pub api_secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metatrader_config_requires_server_login_password() {
        let mut config = AccountConfiguration {
            account_id: 1,
            server: Some("demo.broker.com:443".to_string()),
            login: Some("10042".to_string()),
            ..Default::default()
        };
        assert!(!config.is_complete(Platform::MetaTrader));
        assert!(config.credentials(Platform::MetaTrader).is_none());

        config.password = Some("secret".to_string());
        assert!(config.is_complete(Platform::MetaTrader));
        assert!(config.credentials(Platform::MetaTrader).is_some());
    }

    #[test]
    fn api_broker_config_requires_key_pair() {
        let config = AccountConfiguration {
            account_id: 2,
            api_key: Some("key".to_string()),
            api_secret: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(config.is_complete(Platform::ApiBroker));
        assert!(!config.is_complete(Platform::MetaTrader));
    }
}
