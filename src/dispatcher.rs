//! Replication fan-out: turns one master trade event into zero-or-more
//! adjusted slave executions.
//!
//! Each slave account gets a dedicated worker task fed by an in-order queue,
//! so replication for one account is serialized (a new master trade lands
//! behind the in-flight one) while fan-out across accounts runs concurrently.
//! Per-account failures are converted into FAILED audit rows and never abort
//! sibling accounts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::broadcast::EventBroadcaster;
use crate::conflict::{ConflictManager, Decision};
use crate::connector::PlatformConnector;
use crate::db::Database;
use crate::error::CONFLICT_BLOCKED_MESSAGE;
use crate::models::{
    Account, FeatureConfig, MasterTrade, ReplicatedTrade, TradeStatus,
};
use crate::registry::AccountRegistry;
use crate::risk;
use crate::stats::StatsAggregator;

struct Job {
    trade: MasterTrade,
    source_platform: String,
    /// Set for drained queue entries: the conflict window already elapsed.
    bypass_conflict: bool,
    done: Option<oneshot::Sender<()>>,
}

struct Inner {
    db: Arc<Database>,
    registry: Arc<AccountRegistry>,
    conflict: Arc<ConflictManager>,
    stats: Arc<StatsAggregator>,
    broadcaster: EventBroadcaster,
    features: Arc<RwLock<FeatureConfig>>,
    connectors: RwLock<HashMap<i64, Arc<dyn PlatformConnector>>>,
    workers: Mutex<HashMap<i64, mpsc::UnboundedSender<Job>>>,
    running: AtomicBool,
}

/// Consumes master trade events and replicates them to eligible slaves.
#[derive(Clone)]
pub struct ReplicationDispatcher {
    inner: Arc<Inner>,
}

impl ReplicationDispatcher {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<AccountRegistry>,
        conflict: Arc<ConflictManager>,
        stats: Arc<StatsAggregator>,
        broadcaster: EventBroadcaster,
        features: Arc<RwLock<FeatureConfig>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                registry,
                conflict,
                stats,
                broadcaster,
                features,
                connectors: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Register the connector handling a slave account's executions.
    pub async fn set_connector(&self, account_id: i64, connector: Arc<dyn PlatformConnector>) {
        self.inner.connectors.write().await.insert(account_id, connector);
    }

    pub async fn remove_connector(&self, account_id: i64) {
        self.inner.connectors.write().await.remove(&account_id);
    }

    /// Explicit lifecycle control, independent of the mirror toggle.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        info!("Replication started");
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        info!("Replication stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Sole entry point for master trade events. Waits for every fan-out
    /// attempt to settle (in any order) before returning; per-account order
    /// is preserved by the worker queues.
    pub async fn on_master_trade(&self, trade: MasterTrade) -> Result<()> {
        if !self.is_running() {
            debug!("Replication stopped, ignoring master trade");
            return Ok(());
        }
        if !self.inner.features.read().await.is_mirror_active {
            debug!("Mirror inactive, ignoring master trade");
            return Ok(());
        }

        let master = match self.inner.registry.active_master().await {
            Ok(master) => master,
            Err(e) => {
                warn!(error = %e, "Cannot replicate without a single active master");
                return Ok(());
            }
        };
        let source_platform = master.platform.as_str().to_string();

        info!(
            symbol = %trade.symbol,
            side = trade.side.as_str(),
            volume = %trade.volume,
            price = %trade.price,
            "Master trade observed"
        );

        // The originating trade gets its own audit row.
        let master_row = ReplicatedTrade {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: None,
            symbol: trade.symbol.clone(),
            side: trade.side,
            volume: trade.volume,
            price: trade.price,
            take_profit: None,
            stop_loss: None,
            status: TradeStatus::Success,
            latency_ms: None,
            source_platform: source_platform.clone(),
            target_platform: source_platform.clone(),
            error_message: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.inner.db.insert_trade(&master_row).await {
            error!(error = %e, "Failed to record master trade");
        } else {
            self.inner.broadcaster.new_trade(&master_row);
        }

        let slaves = self.inner.registry.eligible_slaves().await?;
        if slaves.is_empty() {
            debug!("No eligible slave accounts");
            return Ok(());
        }

        let mut settled = Vec::with_capacity(slaves.len());
        for (account, _credentials) in slaves {
            let (done_tx, done_rx) = oneshot::channel();
            self.enqueue_job(
                account.id,
                Job {
                    trade: trade.clone(),
                    source_platform: source_platform.clone(),
                    bypass_conflict: false,
                    done: Some(done_tx),
                },
            )
            .await;
            settled.push(done_rx);
        }

        // Unordered across accounts; the cycle completes when all attempts
        // have settled. A dropped receiver only means a worker went away.
        join_all(settled).await;
        Ok(())
    }

    /// Auto-resume sweep: re-submit replications whose conflict window has
    /// elapsed, through the same per-account queues.
    pub async fn resume_queued(&self, now: DateTime<Utc>) {
        let drained = self.inner.conflict.drain_ready(now);
        if drained.is_empty() {
            return;
        }

        let source_platform = match self.inner.registry.active_master().await {
            Ok(master) => master.platform.as_str().to_string(),
            Err(e) => {
                warn!(error = %e, "Cannot resume queued replications without a master");
                return;
            }
        };

        let mut settled = Vec::new();
        for (account_id, trades) in drained {
            for trade in trades {
                let (done_tx, done_rx) = oneshot::channel();
                self.enqueue_job(
                    account_id,
                    Job {
                        trade,
                        source_platform: source_platform.clone(),
                        bypass_conflict: true,
                        done: Some(done_tx),
                    },
                )
                .await;
                settled.push(done_rx);
            }
        }
        join_all(settled).await;
    }

    async fn enqueue_job(&self, account_id: i64, job: Job) {
        let mut workers = self.inner.workers.lock().await;

        let sender = match workers.get(&account_id) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        let done = inner.process(account_id, job).await;
                        if let Some(done_tx) = done {
                            let _ = done_tx.send(());
                        }
                    }
                });
                workers.insert(account_id, tx.clone());
                tx
            }
        };

        if sender.send(job).is_err() {
            error!(account = account_id, "Replication worker queue closed");
        }
    }
}

impl Inner {
    /// Handle one replication attempt for one account. Never propagates:
    /// every failure mode ends in an audit row or a log line so sibling
    /// accounts are unaffected.
    async fn process(&self, account_id: i64, job: Job) -> Option<oneshot::Sender<()>> {
        let Job {
            trade,
            source_platform,
            bypass_conflict,
            done,
        } = job;

        let account = match self.registry.get_account(account_id).await {
            Ok(account) => account,
            Err(e) => {
                // Deleted mid-flight; nothing to record against.
                warn!(account = account_id, error = %e, "Skipping replication");
                return done;
            }
        };

        if !bypass_conflict {
            match self
                .conflict
                .decide(account.id, account.conflict_policy, Utc::now())
            {
                Decision::Proceed => {}
                Decision::Queued => {
                    info!(
                        account = account.id,
                        symbol = %trade.symbol,
                        "Replication queued behind manual trading"
                    );
                    self.conflict.enqueue(account.id, trade);
                    return done;
                }
                Decision::Blocked => {
                    warn!(
                        account = account.id,
                        symbol = %trade.symbol,
                        "Replication blocked by manual trading"
                    );
                    self.record_outcome(
                        &account,
                        &trade,
                        &source_platform,
                        None,
                        TradeStatus::Failed,
                        None,
                        Some(CONFLICT_BLOCKED_MESSAGE.to_string()),
                    )
                    .await;
                    return done;
                }
            }
        }

        let features = self.features.read().await.clone();
        let order = match risk::adjust(&trade, &account, &features) {
            Ok(order) => order,
            Err(e) => {
                warn!(account = account.id, error = %e, "Risk adjustment rejected trade");
                self.record_outcome(
                    &account,
                    &trade,
                    &source_platform,
                    None,
                    TradeStatus::Failed,
                    None,
                    Some(e.to_string()),
                )
                .await;
                return done;
            }
        };

        let connector = self.connectors.read().await.get(&account.id).cloned();
        let Some(connector) = connector else {
            warn!(account = account.id, "No connector registered");
            self.record_outcome(
                &account,
                &trade,
                &source_platform,
                Some(&order),
                TradeStatus::Failed,
                None,
                Some("not connected to venue".to_string()),
            )
            .await;
            return done;
        };

        let started = Instant::now();
        let result = connector.execute_order(&order).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(receipt) => {
                info!(
                    account = account.id,
                    symbol = %order.symbol,
                    volume = %order.volume,
                    order_id = %receipt.order_id,
                    latency_ms,
                    "Replicated trade executed"
                );
                self.record_outcome(
                    &account,
                    &trade,
                    &source_platform,
                    Some(&order),
                    TradeStatus::Success,
                    Some(latency_ms),
                    None,
                )
                .await;
            }
            Err(e) => {
                warn!(
                    account = account.id,
                    symbol = %order.symbol,
                    error = %e,
                    "Replicated trade failed"
                );
                self.record_outcome(
                    &account,
                    &trade,
                    &source_platform,
                    Some(&order),
                    TradeStatus::Failed,
                    Some(latency_ms),
                    Some(e.to_string()),
                )
                .await;
            }
        }

        done
    }

    /// Exactly one audit row and one stats update per attempted replication.
    #[allow(clippy::too_many_arguments)]
    async fn record_outcome(
        &self,
        account: &Account,
        trade: &MasterTrade,
        source_platform: &str,
        order: Option<&crate::models::AdjustedOrder>,
        status: TradeStatus,
        latency_ms: Option<i64>,
        error_message: Option<String>,
    ) {
        let row = ReplicatedTrade {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: Some(account.id),
            symbol: trade.symbol.clone(),
            side: trade.side,
            volume: order.map(|o| o.volume).unwrap_or(trade.volume),
            price: trade.price,
            take_profit: order.and_then(|o| o.take_profit),
            stop_loss: order.and_then(|o| o.stop_loss),
            status,
            latency_ms,
            source_platform: source_platform.to_string(),
            target_platform: account.platform.as_str().to_string(),
            error_message,
            created_at: Utc::now(),
        };

        if let Err(e) = self.db.insert_trade(&row).await {
            error!(account = account.id, error = %e, "Failed to record replication outcome");
        } else {
            self.broadcaster.new_trade(&row);
        }

        let success = status == TradeStatus::Success;
        match self
            .stats
            .record(Utc::now().date_naive(), success, latency_ms.unwrap_or(0))
            .await
        {
            Ok(snapshot) => self.broadcaster.stats(&snapshot),
            Err(e) => error!(error = %e, "Failed to update daily stats"),
        }
    }
}
