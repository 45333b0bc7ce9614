//! Engine wiring and lifecycle.
//!
//! Owns the shared components, builds one connector per account, drives the
//! connector event loop, and runs the background probe and auto-resume tasks.
//! Everything the REST surface touches hangs off [`Engine`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::EventBroadcaster;
use crate::conflict::ConflictManager;
use crate::connector::{
    ConnectionHandle, ConnectorEvent, PlatformConnector, SimulatedConnector, SimulationProfile,
};
use crate::db::Database;
use crate::dispatcher::ReplicationDispatcher;
use crate::error::{ConnectionError, RegistryError};
use crate::models::{Account, Connection, ConnectionStatus, FeatureConfig};
use crate::registry::AccountRegistry;
use crate::stats::StatsAggregator;

/// Liveness probe spacing per connected account.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);
/// Spacing of the simulated master trade feed.
const FEED_INTERVAL: Duration = Duration::from_secs(15);
/// How often queued replications are checked for an elapsed conflict window.
const RESUME_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct Engine {
    db: Arc<Database>,
    registry: Arc<AccountRegistry>,
    conflict: Arc<ConflictManager>,
    stats: Arc<StatsAggregator>,
    broadcaster: EventBroadcaster,
    features: Arc<RwLock<FeatureConfig>>,
    dispatcher: ReplicationDispatcher,
    profile: SimulationProfile,
    probe_interval: Duration,
    connectors: RwLock<HashMap<i64, Arc<SimulatedConnector>>>,
    events_tx: mpsc::UnboundedSender<ConnectorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectorEvent>>>,
    probe_tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
    feed_tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub async fn new(db: Arc<Database>, profile: SimulationProfile) -> Result<Arc<Self>> {
        Self::with_probe_interval(db, profile, PROBE_INTERVAL).await
    }

    async fn with_probe_interval(
        db: Arc<Database>,
        profile: SimulationProfile,
        probe_interval: Duration,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(AccountRegistry::new(Arc::clone(&db)));
        let conflict = Arc::new(ConflictManager::default());
        let stats = Arc::new(StatsAggregator::new(Arc::clone(&db)));
        let broadcaster = EventBroadcaster::new();

        let features = db
            .get_feature_config()
            .await
            .context("loading feature configuration")?;
        let features = Arc::new(RwLock::new(features));

        let dispatcher = ReplicationDispatcher::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            Arc::clone(&conflict),
            Arc::clone(&stats),
            broadcaster.clone(),
            Arc::clone(&features),
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            db,
            registry,
            conflict,
            stats,
            broadcaster,
            features,
            dispatcher,
            profile,
            probe_interval,
            connectors: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            probe_tasks: Mutex::new(HashMap::new()),
            feed_tasks: Mutex::new(HashMap::new()),
            background_tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn dispatcher(&self) -> &ReplicationDispatcher {
        &self.dispatcher
    }

    /// Connect every configured account and spawn the background tasks.
    /// Accounts that cannot connect stay registered with a Disconnected row;
    /// the probe loop keeps trying within the reconnect ceiling.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut rx_slot = self.events_rx.lock().await;
            let Some(rx) = rx_slot.take() else {
                anyhow::bail!("engine already started");
            };
            let engine = Arc::clone(self);
            self.background_tasks
                .lock()
                .await
                .push(tokio::spawn(async move {
                    engine.event_loop(rx).await;
                }));
        }

        for account in self.registry.list_accounts().await? {
            if !account.is_active {
                continue;
            }
            if let Err(e) = self.connect_account(&account).await {
                warn!(account = account.id, error = %e, "Initial connection failed");
            }
        }

        let engine = Arc::clone(self);
        self.background_tasks
            .lock()
            .await
            .push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RESUME_SWEEP_INTERVAL);
                loop {
                    ticker.tick().await;
                    engine.dispatcher.resume_queued(Utc::now()).await;
                }
            }));

        info!("Engine started");
        Ok(())
    }

    /// Build (or reuse) the connector for one account and drive a connection
    /// attempt. Supervision (the probe loop, and the trade feed for the
    /// master) is wired up whether or not the attempt succeeds; a failed
    /// attempt leaves the probe loop re-driving reconnect within the ceiling.
    pub async fn connect_account(
        self: &Arc<Self>,
        account: &Account,
    ) -> Result<ConnectionHandle, RegistryError> {
        let credentials = self.registry.credentials(account.id).await?;

        let connector = {
            let mut connectors = self.connectors.write().await;
            match connectors.get(&account.id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let connector = Arc::new(SimulatedConnector::new(
                        account.id,
                        account.platform,
                        self.profile.clone(),
                        self.events_tx.clone(),
                    ));
                    connectors.insert(account.id, Arc::clone(&connector));
                    connector
                }
            }
        };

        if !account.is_master {
            self.dispatcher
                .set_connector(account.id, Arc::clone(&connector) as Arc<dyn PlatformConnector>)
                .await;
        }

        self.upsert_connection_row(account, ConnectionStatus::Connecting, None, None)
            .await;

        let result = connector.connect(&credentials).await;
        self.supervise(account, &connector).await;

        match result {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.upsert_connection_row(account, ConnectionStatus::Disconnected, None, None)
                    .await;
                Err(RegistryError::Storage(anyhow::anyhow!(e)))
            }
        }
    }

    /// Manual reconnect, driven from the REST surface. Valid only while the
    /// connector is disconnected; subject to the reconnect ceiling. A
    /// successful reconnect re-wires supervision, since the probe loop may
    /// have exited at the ceiling.
    pub async fn reconnect_account(
        self: &Arc<Self>,
        account_id: i64,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let connector = self.connectors.read().await.get(&account_id).cloned();
        let Some(connector) = connector else {
            return Err(ConnectionError::InvalidState(
                "no connector for account".to_string(),
            ));
        };

        let handle = connector.reconnect().await?;
        if let Ok(account) = self.registry.get_account(account_id).await {
            self.supervise(&account, &connector).await;
        }
        Ok(handle)
    }

    /// Ensure the account's liveness supervision is running: the probe loop
    /// for every account, plus the trade feed for the master. Idempotent; a
    /// live feed task is never duplicated.
    async fn supervise(self: &Arc<Self>, account: &Account, connector: &Arc<SimulatedConnector>) {
        if account.is_master {
            let mut feeds = self.feed_tasks.lock().await;
            let running = feeds.get(&account.id).is_some_and(|task| !task.is_finished());
            if !running {
                feeds.insert(account.id, connector.spawn_trade_feed(FEED_INTERVAL));
            }
        }
        self.spawn_probe_loop(account.id).await;
    }

    /// One-off liveness probe for the REST surface.
    pub async fn test_connection(&self, account_id: i64) -> Result<u64, ConnectionError> {
        let connector = self.connectors.read().await.get(&account_id).cloned();
        match connector {
            Some(connector) => connector.ping().await,
            None => Err(ConnectionError::InvalidState(
                "no connector for account".to_string(),
            )),
        }
    }

    /// Record manual trading activity on an account; the conflict policy
    /// decides what happens to replications inside the window.
    pub async fn report_manual_trade(&self, account_id: i64) -> Result<(), RegistryError> {
        let account = self.registry.get_account(account_id).await?;
        self.conflict.report_manual_trade(account.id, Utc::now());
        info!(
            account = account.id,
            policy = account.conflict_policy.as_str(),
            "Manual trade reported"
        );
        Ok(())
    }

    /// What the account's conflict policy would do with a replication
    /// request arriving right now.
    pub async fn conflict_decision(
        &self,
        account_id: i64,
    ) -> Result<crate::conflict::Decision, RegistryError> {
        let account = self.registry.get_account(account_id).await?;
        Ok(self
            .conflict
            .decide(account.id, account.conflict_policy, Utc::now()))
    }

    pub async fn feature_config(&self) -> FeatureConfig {
        self.features.read().await.clone()
    }

    /// Replace the feature configuration: persisted, applied to subsequent
    /// replication decisions, and broadcast to subscribers.
    pub async fn update_feature_config(&self, config: FeatureConfig) -> Result<FeatureConfig> {
        self.db.save_feature_config(&config).await?;
        *self.features.write().await = config.clone();
        self.broadcaster.configuration(&config);
        info!(mirror_active = config.is_mirror_active, "Feature configuration updated");
        Ok(config)
    }

    /// Tear down an account's runtime state after deletion: probe loop,
    /// connector, and dispatcher registration.
    pub async fn forget_account(&self, account_id: i64) {
        if let Some(task) = self.probe_tasks.lock().await.remove(&account_id) {
            task.abort();
        }
        if let Some(task) = self.feed_tasks.lock().await.remove(&account_id) {
            task.abort();
        }
        if let Some(connector) = self.connectors.write().await.remove(&account_id) {
            connector.disconnect().await;
        }
        self.dispatcher.remove_connector(account_id).await;
    }

    pub async fn shutdown(&self) {
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        for (_, task) in self.probe_tasks.lock().await.drain() {
            task.abort();
        }
        for (_, task) in self.feed_tasks.lock().await.drain() {
            task.abort();
        }
        let connectors: Vec<_> = self.connectors.read().await.values().cloned().collect();
        for connector in connectors {
            if connector.status() == ConnectionStatus::Connected {
                connector.disconnect().await;
            }
        }
        info!("Engine stopped");
    }

    async fn spawn_probe_loop(self: &Arc<Self>, account_id: i64) {
        let mut probes = self.probe_tasks.lock().await;
        if let Some(previous) = probes.remove(&account_id) {
            previous.abort();
        }

        let engine = Arc::clone(self);
        let probe_interval = self.probe_interval;
        probes.insert(
            account_id,
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(probe_interval);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    let connector = engine.connectors.read().await.get(&account_id).cloned();
                    let Some(connector) = connector else {
                        break;
                    };

                    match connector.status() {
                        ConnectionStatus::Connected => {
                            // A failed probe flips the connector to
                            // Disconnected and emits ConnectionLost; the next
                            // tick picks it up below.
                            let _ = connector.ping().await;
                        }
                        ConnectionStatus::Disconnected => match connector.reconnect().await {
                            Ok(_) => {}
                            Err(ConnectionError::AttemptsExhausted(ceiling)) => {
                                error!(
                                    account = account_id,
                                    ceiling, "Reconnect ceiling reached, giving up"
                                );
                                break;
                            }
                            Err(e) => {
                                warn!(account = account_id, error = %e, "Reconnect failed");
                            }
                        },
                        ConnectionStatus::Connecting => {}
                    }
                }
            }),
        );
    }

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ConnectorEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ConnectorEvent::Connected { account_id, handle } => {
                    self.set_connection_status(
                        account_id,
                        ConnectionStatus::Connected,
                        Some(handle.server),
                        Some(handle.account_label),
                    )
                    .await;
                }
                ConnectorEvent::Disconnected { account_id }
                | ConnectorEvent::ConnectionLost { account_id } => {
                    self.set_connection_status(account_id, ConnectionStatus::Disconnected, None, None)
                        .await;
                }
                ConnectorEvent::Ping {
                    account_id,
                    latency_ms,
                } => {
                    self.record_ping(account_id, latency_ms).await;
                }
                ConnectorEvent::Trade { trade } => {
                    // Processed inline so master trades keep their arrival
                    // order through the dispatcher queues.
                    if let Err(e) = self.dispatcher.on_master_trade(trade).await {
                        error!(error = %e, "Replication cycle failed");
                    }
                }
            }
        }
        debug!("Connector event channel closed");
    }

    async fn set_connection_status(
        &self,
        account_id: i64,
        status: ConnectionStatus,
        server: Option<String>,
        account_label: Option<String>,
    ) {
        let account = match self.registry.get_account(account_id).await {
            Ok(account) => account,
            Err(e) => {
                warn!(account = account_id, error = %e, "Connection event for unknown account");
                return;
            }
        };
        self.upsert_connection_row(&account, status, server, account_label)
            .await;
        self.broadcast_connections().await;
    }

    async fn record_ping(&self, account_id: i64, latency_ms: u64) {
        let connections = match self.db.list_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                error!(error = %e, "Failed to load connections");
                return;
            }
        };
        let Some(mut row) = connections.into_iter().find(|c| c.account_id == account_id) else {
            return;
        };
        row.last_ping_ms = Some(latency_ms as i64);
        row.last_update = Utc::now();
        if let Err(e) = self.db.upsert_connection(&row).await {
            error!(account = account_id, error = %e, "Failed to record ping");
            return;
        }
        self.broadcast_connections().await;
    }

    async fn upsert_connection_row(
        &self,
        account: &Account,
        status: ConnectionStatus,
        server: Option<String>,
        account_label: Option<String>,
    ) {
        let row = Connection {
            account_id: account.id,
            platform: account.platform,
            status,
            server,
            account_label,
            last_ping_ms: None,
            last_update: Utc::now(),
        };
        if let Err(e) = self.db.upsert_connection(&row).await {
            error!(account = account.id, error = %e, "Failed to update connection row");
        }
    }

    async fn broadcast_connections(&self) {
        match self.db.list_connections().await {
            Ok(connections) => self.broadcaster.connections(&connections),
            Err(e) => error!(error = %e, "Failed to load connections"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewAccount;
    use crate::models::{AccountConfiguration, ConflictPolicy, Platform};
    use rust_decimal_macros::dec;

    async fn engine() -> Arc<Engine> {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        Engine::new(db, SimulationProfile::reliable()).await.unwrap()
    }

    async fn add_account(engine: &Arc<Engine>, name: &str, is_master: bool, configured: bool) -> i64 {
        let account = engine
            .registry()
            .create_account(NewAccount {
                name: name.to_string(),
                platform: Platform::MetaTrader,
                is_master,
                is_active: true,
                risk_multiplier: dec!(1),
                conflict_policy: ConflictPolicy::AllowBoth,
                allow_manual_trading: true,
            })
            .await
            .unwrap();
        if configured {
            engine
                .registry()
                .update_configuration(&AccountConfiguration {
                    account_id: account.id,
                    server: Some("demo.broker.com".to_string()),
                    login: Some(format!("login-{}", account.id)),
                    password: Some("secret".to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        account.id
    }

    async fn wait_for_connected(engine: &Arc<Engine>, expected: usize) {
        for _ in 0..50 {
            let rows = engine.db().list_connections().await.unwrap();
            if rows
                .iter()
                .filter(|c| c.status == ConnectionStatus::Connected)
                .count()
                == expected
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("accounts did not connect in time");
    }

    #[tokio::test]
    async fn bootstrap_connects_configured_accounts_only() {
        let engine = engine().await;
        let master = add_account(&engine, "master", true, true).await;
        let slave = add_account(&engine, "slave", false, true).await;
        let bare = add_account(&engine, "bare", false, false).await;

        engine.start().await.unwrap();
        wait_for_connected(&engine, 2).await;

        let rows = engine.db().list_connections().await.unwrap();
        let status_of = |id: i64| rows.iter().find(|c| c.account_id == id).map(|c| c.status);
        assert_eq!(status_of(master), Some(ConnectionStatus::Connected));
        assert_eq!(status_of(slave), Some(ConnectionStatus::Connected));
        // Unconfigured account never gets a connection attempt.
        assert_eq!(status_of(bare), None);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn trade_events_drive_replication() {
        let engine = engine().await;
        add_account(&engine, "master", true, true).await;
        let slave = add_account(&engine, "slave", false, true).await;
        engine.start().await.unwrap();
        wait_for_connected(&engine, 2).await;

        engine
            .events_tx
            .send(ConnectorEvent::Trade {
                trade: crate::models::MasterTrade {
                    symbol: "EURUSD".to_string(),
                    side: crate::models::TradeSide::Buy,
                    volume: dec!(1.0),
                    price: dec!(1.0850),
                    occurred_at: Utc::now(),
                },
            })
            .unwrap();

        for _ in 0..50 {
            if engine.db().list_trades(10, 0).await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let trades = engine.db().list_trades(10, 0).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().any(|t| t.account_id.is_none()));
        assert!(trades.iter().any(|t| t.account_id == Some(slave)));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn feature_update_is_persisted_and_broadcast() {
        let engine = engine().await;
        let mut rx = engine.broadcaster().subscribe();

        let mut config = engine.feature_config().await;
        config.is_mirror_active = false;
        config.enable_stop_loss = true;
        engine.update_feature_config(config).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.data["is_mirror_active"], false);

        // A fresh engine over the same store sees the persisted values.
        let reloaded = Engine::new(Arc::clone(engine.db()), SimulationProfile::reliable())
            .await
            .unwrap();
        let config = reloaded.feature_config().await;
        assert!(!config.is_mirror_active);
        assert!(config.enable_stop_loss);
    }

    #[tokio::test]
    async fn failed_initial_connect_still_gets_supervision() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let engine = Engine::new(db, SimulationProfile::unreachable()).await.unwrap();
        let master = add_account(&engine, "master", true, true).await;

        engine.start().await.unwrap();

        // The connect attempt fails, but the probe loop must exist to keep
        // re-driving reconnect, and the master feed must be armed for the
        // moment a reconnect lands.
        assert!(engine.probe_tasks.lock().await.contains_key(&master));
        assert!(engine.feed_tasks.lock().await.contains_key(&master));

        let rows = engine.db().list_connections().await.unwrap();
        let row = rows.iter().find(|c| c.account_id == master).unwrap();
        assert_eq!(row.status, ConnectionStatus::Disconnected);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn manual_reconnect_restores_probe_supervision() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let engine =
            Engine::with_probe_interval(db, SimulationProfile::reliable(), Duration::from_millis(25))
                .await
                .unwrap();
        let slave = add_account(&engine, "slave", false, true).await;

        engine.start().await.unwrap();
        wait_for_connected(&engine, 1).await;

        // Emulate a probe loop that exited at the reconnect ceiling, leaving
        // the connector down with no supervision.
        if let Some(task) = engine.probe_tasks.lock().await.remove(&slave) {
            task.abort();
        }
        let connector = engine.connectors.read().await.get(&slave).cloned().unwrap();
        connector.disconnect().await;

        engine.reconnect_account(slave).await.unwrap();
        assert!(engine.probe_tasks.lock().await.contains_key(&slave));

        // The re-spawned probe loop pings the recovered connection.
        for _ in 0..50 {
            let rows = engine.db().list_connections().await.unwrap();
            if rows
                .iter()
                .any(|c| c.account_id == slave && c.last_ping_ms.is_some())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let rows = engine.db().list_connections().await.unwrap();
        let row = rows.iter().find(|c| c.account_id == slave).unwrap();
        assert!(row.last_ping_ms.is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn manual_trade_report_requires_existing_account() {
        let engine = engine().await;
        let err = engine.report_manual_trade(404).await.unwrap_err();
        assert!(matches!(err, RegistryError::AccountNotFound(404)));
    }

    #[tokio::test]
    async fn forget_account_drops_runtime_state() {
        let engine = engine().await;
        let slave = add_account(&engine, "slave", false, true).await;
        engine.start().await.unwrap();
        wait_for_connected(&engine, 1).await;

        engine.forget_account(slave).await;
        assert!(!engine.connectors.read().await.contains_key(&slave));

        let err = engine.test_connection(slave).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidState(_)));

        engine.shutdown().await;
    }
}
