//! Simulated venue connector.
//!
//! Stands in for real terminal integrations: connect/ping latencies, venue
//! rejections, and the master trade feed are all random-number driven, with
//! the rates controlled by a [`SimulationProfile`] so tests can pin outcomes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, ExecutionError};
use crate::models::{
    AdjustedOrder, ConnectionStatus, Credentials, ExecutionReceipt, MasterTrade, Platform,
    TradeSide,
};
use crate::risk::point_value;

use super::{ConnectionHandle, ConnectorEvent, PlatformConnector, RECONNECT_CEILING};

/// Symbols the simulated master feed draws from, with a base quote for each.
const FEED_SYMBOLS: &[(&str, &str)] = &[
    ("EURUSD", "1.08500"),
    ("GBPUSD", "1.26400"),
    ("USDJPY", "149.500"),
    ("AUDUSD", "0.65800"),
    ("USDCHF", "0.88200"),
];

/// Tuning knobs for the simulated venue. Failure rates are probabilities in
/// [0, 1]; tests use 0.0 or 1.0 to make outcomes deterministic.
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    pub connect_failure_rate: f64,
    pub execution_failure_rate: f64,
    pub probe_failure_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            connect_failure_rate: 0.05,
            execution_failure_rate: 0.10,
            probe_failure_rate: 0.02,
            min_latency_ms: 20,
            max_latency_ms: 180,
        }
    }
}

impl SimulationProfile {
    /// Never fails, near-zero latency. Used by tests.
    pub fn reliable() -> Self {
        Self {
            connect_failure_rate: 0.0,
            execution_failure_rate: 0.0,
            probe_failure_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 1,
        }
    }

    /// Venue that rejects every connection attempt. Used by tests.
    pub fn unreachable() -> Self {
        Self {
            connect_failure_rate: 1.0,
            ..Self::reliable()
        }
    }
}

/// Random-number-driven connector for one account.
pub struct SimulatedConnector {
    account_id: i64,
    platform: Platform,
    profile: SimulationProfile,
    status: RwLock<ConnectionStatus>,
    consecutive_failures: AtomicU32,
    credentials: Mutex<Option<Credentials>>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
}

impl SimulatedConnector {
    pub fn new(
        account_id: i64,
        platform: Platform,
        profile: SimulationProfile,
        events: mpsc::UnboundedSender<ConnectorEvent>,
    ) -> Self {
        Self {
            account_id,
            platform,
            profile,
            status: RwLock::new(ConnectionStatus::Disconnected),
            consecutive_failures: AtomicU32::new(0),
            credentials: Mutex::new(None),
            events,
        }
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    fn emit(&self, event: ConnectorEvent) {
        // Best-effort: the engine may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    fn roll(&self, probability: f64) -> bool {
        probability > 0.0 && rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }

    fn simulated_latency(&self) -> u64 {
        if self.profile.max_latency_ms <= self.profile.min_latency_ms {
            return self.profile.min_latency_ms;
        }
        rand::thread_rng().gen_range(self.profile.min_latency_ms..=self.profile.max_latency_ms)
    }

    fn handle_for(&self, credentials: &Credentials) -> ConnectionHandle {
        let server = if credentials.server.is_empty() {
            "simulated".to_string()
        } else {
            credentials.server.clone()
        };
        let account_label = if credentials.login.is_empty() {
            format!("{}-{}", self.platform.as_str(), self.account_id)
        } else {
            credentials.login.clone()
        };
        ConnectionHandle {
            server,
            account_label,
        }
    }

    async fn try_connect(
        &self,
        credentials: &Credentials,
    ) -> Result<ConnectionHandle, ConnectionError> {
        self.set_status(ConnectionStatus::Connecting);

        let latency = self.simulated_latency();
        let fail = self.roll(self.profile.connect_failure_rate);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if fail {
            self.set_status(ConnectionStatus::Disconnected);
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            warn!(
                account = self.account_id,
                server = %credentials.server,
                "Simulated venue refused connection"
            );
            return Err(ConnectionError::VenueUnreachable(format!(
                "no response from {}",
                credentials.server
            )));
        }

        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Connected);

        let handle = self.handle_for(credentials);
        info!(
            account = self.account_id,
            server = %handle.server,
            label = %handle.account_label,
            "Connected to simulated venue"
        );
        self.emit(ConnectorEvent::Connected {
            account_id: self.account_id,
            handle: handle.clone(),
        });

        Ok(handle)
    }

    /// Start the master trade feed: random trades at roughly `interval`
    /// spacing while the connector is connected. Only wired up for the
    /// master account's connector.
    pub fn spawn_trade_feed(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if connector.status() != ConnectionStatus::Connected {
                    continue;
                }
                let trade = connector.random_trade();
                debug!(
                    symbol = %trade.symbol,
                    side = trade.side.as_str(),
                    volume = %trade.volume,
                    price = %trade.price,
                    "Master feed emitted trade"
                );
                connector.emit(ConnectorEvent::Trade { trade });
            }
        })
    }

    fn random_trade(&self) -> MasterTrade {
        let mut rng = rand::thread_rng();
        let (symbol, base) = FEED_SYMBOLS[rng.gen_range(0..FEED_SYMBOLS.len())];
        let base: Decimal = base.parse().unwrap_or(Decimal::ONE);

        let side = if rng.gen_bool(0.5) {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        };
        // Volume in hundredths of a lot, 0.01 .. 2.00
        let volume = Decimal::new(rng.gen_range(1..=200), 2);
        let offset_points: i64 = rng.gen_range(-500..=500);
        let price = base + Decimal::from(offset_points) * point_value(symbol);

        MasterTrade {
            symbol: symbol.to_string(),
            side,
            volume,
            price,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
impl PlatformConnector for SimulatedConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle, ConnectionError> {
        if self.status() == ConnectionStatus::Connected {
            return Err(ConnectionError::InvalidState("already connected".to_string()));
        }

        // Remember credentials regardless of outcome so reconnect can retry.
        *self.credentials.lock().expect("credentials lock poisoned") = Some(credentials.clone());

        self.try_connect(credentials).await
    }

    async fn disconnect(&self) {
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(ConnectorEvent::Disconnected {
            account_id: self.account_id,
        });
        info!(account = self.account_id, "Disconnected");
    }

    async fn reconnect(&self) -> Result<ConnectionHandle, ConnectionError> {
        if self.status() != ConnectionStatus::Disconnected {
            return Err(ConnectionError::InvalidState(
                "reconnect is only valid from disconnected".to_string(),
            ));
        }

        // Terminal after the ceiling: fail without touching the venue until
        // the caller explicitly re-drives the lifecycle.
        if self.consecutive_failures.load(Ordering::SeqCst) >= RECONNECT_CEILING {
            return Err(ConnectionError::AttemptsExhausted(RECONNECT_CEILING));
        }

        let credentials = self
            .credentials
            .lock()
            .expect("credentials lock poisoned")
            .clone()
            .ok_or_else(|| ConnectionError::InvalidState("never connected".to_string()))?;

        self.try_connect(&credentials).await
    }

    async fn execute_order(
        &self,
        order: &AdjustedOrder,
    ) -> Result<ExecutionReceipt, ExecutionError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ExecutionError::NotConnected);
        }

        let latency = self.simulated_latency();
        let (fail, failure_pick, price_jitter) = {
            let mut rng = rand::thread_rng();
            (
                self.profile.execution_failure_rate > 0.0
                    && rng.gen_bool(self.profile.execution_failure_rate.clamp(0.0, 1.0)),
                rng.gen_range(0..3u8),
                rng.gen_range(-2..=2i64),
            )
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if fail {
            let err = match failure_pick {
                0 => ExecutionError::InsufficientMargin,
                1 => ExecutionError::MarketClosed {
                    symbol: order.symbol.clone(),
                },
                _ => ExecutionError::SlippageExceeded {
                    max_points: order.max_slippage,
                },
            };
            warn!(
                account = self.account_id,
                symbol = %order.symbol,
                error = %err,
                "Simulated venue rejected order"
            );
            return Err(err);
        }

        let executed_price =
            order.price + Decimal::from(price_jitter) * point_value(&order.symbol);

        Ok(ExecutionReceipt {
            order_id: uuid::Uuid::new_v4().to_string(),
            executed_price,
        })
    }

    async fn ping(&self) -> Result<u64, ConnectionError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ConnectionError::InvalidState("not connected".to_string()));
        }

        let latency = self.simulated_latency();
        let fail = self.roll(self.profile.probe_failure_rate);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if fail {
            self.set_status(ConnectionStatus::Disconnected);
            warn!(account = self.account_id, "Probe failed, connection lost");
            self.emit(ConnectorEvent::ConnectionLost {
                account_id: self.account_id,
            });
            return Err(ConnectionError::VenueUnreachable("probe timed out".to_string()));
        }

        self.emit(ConnectorEvent::Ping {
            account_id: self.account_id,
            latency_ms: latency,
        });
        Ok(latency)
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read().expect("status lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn credentials() -> Credentials {
        Credentials {
            server: "demo.broker.com:443".to_string(),
            login: "10042".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        }
    }

    fn connector(profile: SimulationProfile) -> (SimulatedConnector, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SimulatedConnector::new(1, Platform::MetaTrader, profile, tx),
            rx,
        )
    }

    fn order() -> AdjustedOrder {
        AdjustedOrder {
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume: dec!(0.5),
            price: dec!(1.0850),
            take_profit: None,
            stop_loss: None,
            trailing_stop: None,
            max_slippage: 3,
        }
    }

    #[tokio::test]
    async fn connect_transitions_to_connected_and_emits_event() {
        let (connector, mut rx) = connector(SimulationProfile::reliable());
        assert_eq!(connector.status(), ConnectionStatus::Disconnected);

        let handle = connector.connect(&credentials()).await.unwrap();
        assert_eq!(connector.status(), ConnectionStatus::Connected);
        assert_eq!(handle.server, "demo.broker.com:443");
        assert_eq!(handle.account_label, "10042");

        match rx.recv().await.unwrap() {
            ConnectorEvent::Connected { account_id, .. } => assert_eq!(account_id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_connect_falls_back_to_disconnected() {
        let (connector, _rx) = connector(SimulationProfile::unreachable());
        let err = connector.connect(&credentials()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::VenueUnreachable(_)));
        assert_eq!(connector.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_ceiling_fails_immediately_on_sixth_call() {
        let (connector, _rx) = connector(SimulationProfile::unreachable());
        connector.connect(&credentials()).await.unwrap_err();

        // Four more failed reconnects bring consecutive failures to five.
        for _ in 0..4 {
            let err = connector.reconnect().await.unwrap_err();
            assert!(matches!(err, ConnectionError::VenueUnreachable(_)));
        }

        let err = connector.reconnect().await.unwrap_err();
        assert_eq!(err, ConnectionError::AttemptsExhausted(RECONNECT_CEILING));
        // Still terminal on the next call too.
        let err = connector.reconnect().await.unwrap_err();
        assert_eq!(err, ConnectionError::AttemptsExhausted(RECONNECT_CEILING));
    }

    #[tokio::test]
    async fn successful_connect_resets_failure_count() {
        let (connector, _rx) = connector(SimulationProfile::unreachable());

        connector.connect(&credentials()).await.unwrap_err();
        assert_eq!(connector.consecutive_failures.load(Ordering::SeqCst), 1);

        connector.consecutive_failures.store(0, Ordering::SeqCst); // as a successful attempt would
        assert!(connector.reconnect().await.is_err()); // attempts again rather than failing fast
        assert_eq!(connector.consecutive_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_is_invalid_while_connected() {
        let (connector, _rx) = connector(SimulationProfile::reliable());
        connector.connect(&credentials()).await.unwrap();

        let err = connector.reconnect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn execute_requires_connection() {
        let (connector, _rx) = connector(SimulationProfile::reliable());
        let err = connector.execute_order(&order()).await.unwrap_err();
        assert_eq!(err, ExecutionError::NotConnected);
    }

    #[tokio::test]
    async fn execute_returns_receipt_when_connected() {
        let (connector, _rx) = connector(SimulationProfile::reliable());
        connector.connect(&credentials()).await.unwrap();

        let receipt = connector.execute_order(&order()).await.unwrap();
        assert!(!receipt.order_id.is_empty());
        // Jitter is at most two points either side.
        assert!((receipt.executed_price - dec!(1.0850)).abs() <= dec!(0.00002));
    }

    #[tokio::test]
    async fn probe_failure_drops_connection_and_emits_lost() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let profile = SimulationProfile {
            probe_failure_rate: 1.0,
            ..SimulationProfile::reliable()
        };
        let connector = SimulatedConnector::new(3, Platform::ApiBroker, profile, tx);
        connector
            .connect(&Credentials {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = connector.ping().await.unwrap_err();
        assert!(matches!(err, ConnectionError::VenueUnreachable(_)));
        assert_eq!(connector.status(), ConnectionStatus::Disconnected);

        // Connected event first, then the loss notification.
        let mut saw_lost = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ConnectorEvent::ConnectionLost { account_id: 3 }) {
                saw_lost = true;
            }
        }
        assert!(saw_lost);
    }
}
