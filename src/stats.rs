use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    state_store::{StateStore, SubscriptionId},
    types::{DashboardState, DerivedStats, RemoteStats, Trend},
    utils::round2,
};

/// Direction of floating P&L between two successive distinct readings.
pub fn next_trend(prev: Option<f64>, cur: f64) -> Trend {
    match prev {
        Some(p) if cur > p => Trend::Up,
        Some(p) if cur < p => Trend::Down,
        _ => Trend::Neutral,
    }
}

#[derive(Default)]
struct Inner {
    initialized: bool,
    last_pnl: Option<f64>,
    floating_pnl: f64,
    trend: Trend,
    remote: Option<RemoteStats>,
    remote_seq: u64,
}

/// Derives dashboard stats from committed state plus the server-side trade aggregate.
///
/// Runs as a StateStore observer. Only distinct commits reach it, so a repeated value
/// never produces a second notification. The trend compares the floating P&L of the
/// last two distinct commits.
#[derive(Clone)]
pub struct StatsAggregator {
    inner: Arc<Mutex<Inner>>,
    tx: Arc<watch::Sender<Option<DerivedStats>>>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            tx: Arc::new(tx),
        }
    }

    pub fn attach(&self, store: &StateStore) -> SubscriptionId {
        let this = self.clone();
        store.subscribe(move |state| this.observe(state))
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DerivedStats>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<DerivedStats> {
        self.tx.borrow().clone()
    }

    pub fn observe(&self, state: &DashboardState) {
        if !state.initialized {
            return;
        }
        let mut inner = self.inner.lock();
        let pnl = state.floating_pnl();
        inner.initialized = true;
        inner.trend = next_trend(inner.last_pnl, pnl);
        inner.last_pnl = Some(pnl);
        inner.floating_pnl = pnl;
        self.publish(&inner);
    }

    /// `seq` orders fetches by issue time; an answer older than the one applied is dropped.
    pub fn set_remote(&self, seq: u64, remote: RemoteStats) {
        let mut inner = self.inner.lock();
        if seq < inner.remote_seq {
            log::debug!("stats.remote_stale seq={} applied={}", seq, inner.remote_seq);
            return;
        }
        log::debug!(
            "stats.remote seq={} total_profit={} win_rate_pct={}",
            seq,
            remote.total_profit,
            remote.win_rate_pct
        );
        inner.remote_seq = seq;
        inner.remote = Some(remote);
        self.publish(&inner);
    }

    fn publish(&self, inner: &Inner) {
        if !inner.initialized {
            return;
        }
        let remote = inner.remote.clone().unwrap_or_default();
        let next = DerivedStats {
            total_profit: round2(remote.total_profit),
            today_profit: round2(remote.today_profit),
            win_rate_pct: round2(remote.win_rate_pct),
            buy_count: remote.buy_count,
            sell_count: remote.sell_count,
            avg_hold_seconds: remote.avg_hold_seconds,
            best_pair: remote.best_pair,
            worst_pair: remote.worst_pair,
            floating_pnl: inner.floating_pnl,
            trend: inner.trend,
        };
        self.tx.send_if_modified(|cur| {
            if cur.as_ref() == Some(&next) {
                false
            } else {
                *cur = Some(next);
                true
            }
        });
    }
}
