//! State-change notifications pushed to external subscribers.
//!
//! Best-effort, at-most-once delivery over a `tokio::sync::broadcast`
//! channel: a subscriber that is absent or lagging simply misses messages,
//! there is no buffering or replay.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{Connection, DailyStats, FeatureConfig, ReplicatedTrade};

const CHANNEL_CAPACITY: usize = 256;

/// Message kind, serialized into the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PushKind {
    NewTrade,
    Connections,
    Configuration,
    Stats,
    TradesCleared,
}

/// JSON envelope delivered to every subscriber: `{type, data, timestamp}`.
/// Consumers treat each as a full replacement or append per type; there are
/// no sequence numbers.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: PushKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Publish/subscribe fan-out to dashboard clients.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<PushMessage>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.tx.subscribe()
    }

    fn publish<T: Serialize>(&self, kind: PushKind, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(kind = ?kind, error = %e, "Failed to serialize push message");
                return;
            }
        };
        // A send error only means there is no subscriber right now.
        let _ = self.tx.send(PushMessage {
            kind,
            data,
            timestamp: Utc::now(),
        });
    }

    pub fn new_trade(&self, trade: &ReplicatedTrade) {
        self.publish(PushKind::NewTrade, trade);
    }

    pub fn connections(&self, connections: &[Connection]) {
        self.publish(PushKind::Connections, &connections);
    }

    pub fn configuration(&self, config: &FeatureConfig) {
        self.publish(PushKind::Configuration, config);
    }

    pub fn stats(&self, stats: &DailyStats) {
        self.publish(PushKind::Stats, stats);
    }

    pub fn trades_cleared(&self) {
        self.publish(PushKind::TradesCleared, &serde_json::json!({}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TradeSide, TradeStatus};
    use rust_decimal_macros::dec;

    fn sample_trade() -> ReplicatedTrade {
        ReplicatedTrade {
            id: "t1".to_string(),
            account_id: Some(2),
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume: dec!(0.5),
            price: dec!(1.0850),
            take_profit: None,
            stop_loss: None,
            status: TradeStatus::Success,
            latency_ms: Some(80),
            source_platform: "metatrader".to_string(),
            target_platform: "metatrader".to_string(),
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_typed_envelope() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.new_trade(&sample_trade());

        let message = rx.recv().await.unwrap();
        assert_eq!(message.kind, PushKind::NewTrade);
        assert_eq!(message.data["symbol"], "EURUSD");

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "newTrade");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.trades_cleared();
        broadcaster.stats(&DailyStats::empty(Utc::now().date_naive()));
    }

    #[tokio::test]
    async fn late_subscribers_do_not_see_past_messages() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.new_trade(&sample_trade());

        let mut rx = broadcaster.subscribe();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
