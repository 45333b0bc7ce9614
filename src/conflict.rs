//! Conflict arbitration between automated replication and manual trading.
//!
//! Tracks the most recent manual trade per slave account. A replication
//! request landing inside the rolling detection window is resolved per the
//! account's policy; queued requests are drained by a time-triggered sweep
//! once the window elapses without further manual activity.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::models::{ConflictPolicy, MasterTrade};

/// Default rolling detection window after a manual trade.
pub const DEFAULT_WINDOW_SECS: i64 = 300;

/// Default bound on queued replications per account.
pub const DEFAULT_MAX_QUEUED: usize = 10;

/// Outcome of conflict arbitration for one replication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Queued,
    Blocked,
}

#[derive(Debug, Default)]
struct AccountState {
    last_manual_at: Option<DateTime<Utc>>,
    queued: VecDeque<MasterTrade>,
}

/// Per-account manual-activity tracking and replication queueing.
pub struct ConflictManager {
    window: Duration,
    max_queued: usize,
    accounts: Mutex<HashMap<i64, AccountState>>,
}

impl Default for ConflictManager {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_WINDOW_SECS), DEFAULT_MAX_QUEUED)
    }
}

impl ConflictManager {
    pub fn new(window: Duration, max_queued: usize) -> Self {
        Self {
            window,
            max_queued,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a manual trade reported against a slave account. Restarts the
    /// detection window and therefore the auto-resume timer.
    pub fn report_manual_trade(&self, account_id: i64, at: DateTime<Utc>) {
        let mut accounts = self.accounts.lock().expect("conflict state poisoned");
        let state = accounts.entry(account_id).or_default();
        state.last_manual_at = Some(at);
        info!(account = account_id, at = %at, "Manual trade reported");
    }

    /// Arbitrate one replication request. No manual activity within the
    /// window always proceeds, regardless of policy.
    pub fn decide(&self, account_id: i64, policy: ConflictPolicy, now: DateTime<Utc>) -> Decision {
        let accounts = self.accounts.lock().expect("conflict state poisoned");
        let in_window = accounts
            .get(&account_id)
            .and_then(|s| s.last_manual_at)
            .map(|last| now - last < self.window)
            .unwrap_or(false);

        if !in_window {
            return Decision::Proceed;
        }

        match policy {
            ConflictPolicy::PauseReplication => Decision::Queued,
            ConflictPolicy::BlockManual => Decision::Blocked,
            ConflictPolicy::AllowBoth => Decision::Proceed,
        }
    }

    /// Queue a replication for later. Overflow drops the OLDEST queued item
    /// to preserve most-recent intent.
    pub fn enqueue(&self, account_id: i64, trade: MasterTrade) {
        let mut accounts = self.accounts.lock().expect("conflict state poisoned");
        let state = accounts.entry(account_id).or_default();

        if state.queued.len() >= self.max_queued {
            let dropped = state.queued.pop_front();
            debug!(
                account = account_id,
                symbol = dropped.as_ref().map(|t| t.symbol.as_str()).unwrap_or(""),
                "Replication queue full, dropping oldest entry"
            );
        }
        state.queued.push_back(trade);
    }

    /// Number of replications currently queued for an account.
    pub fn queued_len(&self, account_id: i64) -> usize {
        let accounts = self.accounts.lock().expect("conflict state poisoned");
        accounts.get(&account_id).map(|s| s.queued.len()).unwrap_or(0)
    }

    /// Take all queued replications for accounts whose window has elapsed
    /// with no further manual activity, preserving per-account order.
    /// Called by the auto-resume sweep.
    pub fn drain_ready(&self, now: DateTime<Utc>) -> Vec<(i64, Vec<MasterTrade>)> {
        let mut accounts = self.accounts.lock().expect("conflict state poisoned");
        let mut drained = Vec::new();

        for (account_id, state) in accounts.iter_mut() {
            if state.queued.is_empty() {
                continue;
            }
            let still_gated = state
                .last_manual_at
                .map(|last| now - last < self.window)
                .unwrap_or(false);
            if still_gated {
                continue;
            }
            let trades: Vec<MasterTrade> = state.queued.drain(..).collect();
            info!(account = account_id, count = trades.len(), "Auto-resuming queued replications");
            drained.push((*account_id, trades));
        }

        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;
    use rust_decimal_macros::dec;

    fn trade(symbol: &str) -> MasterTrade {
        MasterTrade {
            symbol: symbol.to_string(),
            side: TradeSide::Buy,
            volume: dec!(1.0),
            price: dec!(1.0850),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn no_manual_activity_always_proceeds() {
        let manager = ConflictManager::default();
        let now = Utc::now();
        for policy in [
            ConflictPolicy::PauseReplication,
            ConflictPolicy::BlockManual,
            ConflictPolicy::AllowBoth,
        ] {
            assert_eq!(manager.decide(7, policy, now), Decision::Proceed);
        }
    }

    #[test]
    fn manual_trade_inside_window_applies_policy() {
        let manager = ConflictManager::default();
        let manual_at = Utc::now();
        manager.report_manual_trade(1, manual_at);

        let request_at = manual_at + Duration::minutes(1);
        assert_eq!(
            manager.decide(1, ConflictPolicy::PauseReplication, request_at),
            Decision::Queued
        );
        assert_eq!(
            manager.decide(1, ConflictPolicy::BlockManual, request_at),
            Decision::Blocked
        );
        assert_eq!(
            manager.decide(1, ConflictPolicy::AllowBoth, request_at),
            Decision::Proceed
        );
    }

    #[test]
    fn window_elapse_restores_proceed() {
        let manager = ConflictManager::default();
        let manual_at = Utc::now();
        manager.report_manual_trade(1, manual_at);

        let after_window = manual_at + Duration::minutes(6);
        assert_eq!(
            manager.decide(1, ConflictPolicy::PauseReplication, after_window),
            Decision::Proceed
        );
    }

    #[test]
    fn manual_activity_only_gates_that_account() {
        let manager = ConflictManager::default();
        let now = Utc::now();
        manager.report_manual_trade(1, now);

        assert_eq!(
            manager.decide(2, ConflictPolicy::BlockManual, now),
            Decision::Proceed
        );
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let manager = ConflictManager::new(Duration::minutes(5), 3);
        manager.enqueue(1, trade("EURUSD"));
        manager.enqueue(1, trade("GBPUSD"));
        manager.enqueue(1, trade("USDJPY"));
        manager.enqueue(1, trade("AUDUSD"));

        assert_eq!(manager.queued_len(1), 3);

        let drained = manager.drain_ready(Utc::now());
        let (_, trades) = &drained[0];
        let symbols: Vec<&str> = trades.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["GBPUSD", "USDJPY", "AUDUSD"]);
    }

    #[test]
    fn drain_waits_for_window_to_elapse() {
        let manager = ConflictManager::default();
        let manual_at = Utc::now();
        manager.report_manual_trade(1, manual_at);
        manager.enqueue(1, trade("EURUSD"));

        assert!(manager.drain_ready(manual_at + Duration::minutes(4)).is_empty());

        let drained = manager.drain_ready(manual_at + Duration::minutes(5));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, 1);
        assert_eq!(drained[0].1.len(), 1);
        assert_eq!(manager.queued_len(1), 0);
    }

    #[test]
    fn fresh_manual_trade_restarts_resume_timer() {
        let manager = ConflictManager::default();
        let first = Utc::now();
        manager.report_manual_trade(1, first);
        manager.enqueue(1, trade("EURUSD"));

        // More manual activity three minutes in pushes the resume point out.
        manager.report_manual_trade(1, first + Duration::minutes(3));

        assert!(manager.drain_ready(first + Duration::minutes(6)).is_empty());
        assert_eq!(manager.drain_ready(first + Duration::minutes(8)).len(), 1);
    }
}
