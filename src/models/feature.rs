//! Global replication feature toggles.

use serde::{Deserialize, Serialize};

/// Read on every replication decision; mutations take effect on the next
/// master trade event, never retroactively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Master switch: when false, master trade events are no-ops
    pub is_mirror_active: bool,

    pub enable_take_profit: bool,
    pub take_profit_points: i64,

    pub enable_stop_loss: bool,
    pub stop_loss_points: i64,

    pub enable_trailing_stop: bool,
    pub trailing_stop_points: i64,

    /// Maximum tolerated slippage in points, passed through to the venue
    pub max_slippage: i64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            is_mirror_active: true,
            enable_take_profit: false,
            take_profit_points: 100,
            enable_stop_loss: false,
            stop_loss_points: 50,
            enable_trailing_stop: false,
            trailing_stop_points: 30,
            max_slippage: 3,
        }
    }
}
