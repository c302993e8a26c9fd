use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{
    AccountInfo, DashboardState, Liveness, PendingView, Position, Source, Version,
};

pub type Observer = Arc<dyn Fn(&Arc<DashboardState>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotPatch {
    pub running: Option<bool>,
    pub terminal_connected: Option<bool>,
    pub open_position_count: Option<usize>,
}

/// A candidate next state, expressed as patches against the version it was computed from.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub base: Version,
    pub source: Source,
    pub initialize: bool,
    pub bot: Option<BotPatch>,
    pub positions: Option<Vec<Position>>,
    pub account: Option<AccountInfo>,
    pub liveness: Option<Liveness>,
    pub pending: Option<Vec<PendingView>>,
}

impl StateUpdate {
    pub fn new(base: Version, source: Source) -> Self {
        Self {
            base,
            source,
            initialize: false,
            bot: None,
            positions: None,
            account: None,
            liveness: None,
            pending: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed(Arc<DashboardState>),
    /// The update matched the current state; nothing was written and no observer ran.
    Unchanged,
    /// The update was computed against an older version and was dropped.
    Stale { current: Version },
}

impl CommitOutcome {
    pub fn committed(&self) -> Option<&Arc<DashboardState>> {
        match self {
            CommitOutcome::Committed(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    list: Vec<(SubscriptionId, Observer)>,
}

struct Inner {
    current: RwLock<Arc<DashboardState>>,
    // Serializes commits and keeps observer delivery in commit order.
    commit_lock: Mutex<()>,
    observers: Mutex<Observers>,
}

/// Canonical dashboard state. `commit` is the only mutation path.
///
/// Observers run synchronously on the committing thread, after the new snapshot is
/// visible to `read()`. They must not call `commit` themselves.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                current: RwLock::new(Arc::new(DashboardState::default())),
                commit_lock: Mutex::new(()),
                observers: Mutex::new(Observers::default()),
            }),
        }
    }

    pub fn read(&self) -> Arc<DashboardState> {
        self.inner.current.read().clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<DashboardState>) + Send + Sync + 'static,
    {
        let mut obs = self.inner.observers.lock();
        obs.next_id += 1;
        let id = SubscriptionId(obs.next_id);
        obs.list.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut obs = self.inner.observers.lock();
        let before = obs.list.len();
        obs.list.retain(|(sid, _)| *sid != id);
        obs.list.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.observers.lock().list.len()
    }

    /// Releases every observer. Called on session teardown.
    pub fn close(&self) {
        self.inner.observers.lock().list.clear();
    }

    pub fn commit(&self, update: StateUpdate) -> CommitOutcome {
        let _serial = self.inner.commit_lock.lock();
        let current = self.read();
        if update.base != current.version() {
            return CommitOutcome::Stale {
                current: current.version(),
            };
        }

        let mut next = (*current).clone();
        apply(&mut next, update);
        if next == *current {
            return CommitOutcome::Unchanged;
        }
        next.bot.version = current.version().next();

        let next = Arc::new(next);
        *self.inner.current.write() = next.clone();

        let observers: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .list
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in observers {
            f(&next);
        }
        CommitOutcome::Committed(next)
    }
}

fn apply(state: &mut DashboardState, update: StateUpdate) {
    if update.initialize {
        state.initialized = true;
    }
    if let Some(patch) = update.bot {
        // Source tracks the origin of the last run/terminal flag write, not count refreshes.
        let flags_written = patch.running.is_some() || patch.terminal_connected.is_some();
        if let Some(r) = patch.running {
            state.bot.running = r;
        }
        if let Some(t) = patch.terminal_connected {
            state.bot.terminal_connected = t;
        }
        if let Some(n) = patch.open_position_count {
            state.bot.open_position_count = n;
        }
        if flags_written {
            state.bot.source = update.source;
            if update.source != Source::Optimistic {
                state.bot.last_confirmed_by = update.source.into();
            }
        }
    }
    if let Some(positions) = update.positions {
        state.positions = merge_positions(&state.positions, positions);
    }
    if let Some(account) = update.account {
        state.account = Some(account);
    }
    if let Some(liveness) = update.liveness {
        state.liveness = liveness;
    }
    if let Some(pending) = update.pending {
        state.pending = pending;
    }
}

/// Wholesale replacement keyed by ticket. Unchanged positions keep their `updated_at`.
fn merge_positions(prev: &[Position], incoming: Vec<Position>) -> Vec<Position> {
    let prev_by_ticket: BTreeMap<u64, &Position> = prev.iter().map(|p| (p.ticket, p)).collect();
    let mut out: BTreeMap<u64, Position> = BTreeMap::new();
    for mut p in incoming {
        if let Some(old) = prev_by_ticket.get(&p.ticket) {
            if old.same_as(&p) {
                p.updated_at = old.updated_at;
            }
        }
        out.insert(p.ticket, p);
    }
    out.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pos(ticket: u64, profit: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            direction: Direction::Buy,
            volume: 0.1,
            open_price: 1.1,
            current_price: 1.1,
            profit,
            stop_loss: None,
            take_profit: None,
            updated_at: Utc::now(),
        }
    }

    fn running(store: &StateStore, value: bool, source: Source) -> CommitOutcome {
        let mut u = StateUpdate::new(store.read().version(), source);
        u.bot = Some(BotPatch {
            running: Some(value),
            ..Default::default()
        });
        store.commit(u)
    }

    #[test]
    fn versions_strictly_increase() {
        let store = StateStore::new();
        let mut seen = vec![store.read().version()];
        for (i, src) in [Source::Poll, Source::Feed, Source::Optimistic, Source::Poll]
            .into_iter()
            .enumerate()
        {
            running(&store, i % 2 == 0, src);
            seen.push(store.read().version());
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    }

    #[test]
    fn identical_value_from_same_source_notifies_once() {
        let store = StateStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(running(&store, true, Source::Feed).committed().is_some());
        assert!(matches!(running(&store, true, Source::Feed), CommitOutcome::Unchanged));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.read().version(), Version(1));
    }

    #[test]
    fn stale_base_is_rejected() {
        let store = StateStore::new();
        running(&store, true, Source::Poll);
        let mut u = StateUpdate::new(Version(0), Source::Feed);
        u.bot = Some(BotPatch {
            running: Some(false),
            ..Default::default()
        });
        assert!(matches!(
            store.commit(u),
            CommitOutcome::Stale { current: Version(1) }
        ));
        assert!(store.read().bot.running);
    }

    #[test]
    fn observers_see_commits_in_order_and_can_read() {
        let store = StateStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let reader = store.clone();
        store.subscribe(move |snap| {
            assert_eq!(reader.read().version(), snap.version());
            s.lock().push(snap.version().0);
        });
        running(&store, true, Source::Poll);
        running(&store, false, Source::Feed);
        running(&store, true, Source::Optimistic);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn unsubscribe_and_close_release_observers() {
        let store = StateStore::new();
        let a = store.subscribe(|_| {});
        store.subscribe(|_| {});
        assert!(store.unsubscribe(a));
        assert!(!store.unsubscribe(a));
        assert_eq!(store.subscriber_count(), 1);
        store.close();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn optimistic_source_does_not_claim_confirmation() {
        let store = StateStore::new();
        running(&store, false, Source::Poll);
        running(&store, true, Source::Optimistic);
        let s = store.read();
        assert_eq!(s.bot.source, Source::Optimistic);
        assert_eq!(s.bot.last_confirmed_by, crate::types::ConfirmedBy::Poll);
    }

    #[test]
    fn snapshot_replacement_drops_missing_and_keeps_unchanged_timestamps() {
        let store = StateStore::new();
        let mut a = pos(1, 10.0);
        let mut b = pos(2, 5.5);
        a.updated_at = Utc::now() - ChronoDuration::seconds(60);
        b.updated_at = a.updated_at;
        let first_b = b.clone();

        let mut u = StateUpdate::new(Version(0), Source::Poll);
        u.positions = Some(vec![b.clone(), a]);
        store.commit(u);
        assert_eq!(store.read().positions.len(), 2);
        assert_eq!(store.read().positions[0].ticket, 1);

        let mut b_again = b.clone();
        b_again.updated_at = Utc::now();
        let mut u = StateUpdate::new(store.read().version(), Source::Poll);
        u.positions = Some(vec![b_again]);
        store.commit(u);

        let s = store.read();
        assert_eq!(s.positions.len(), 1);
        assert!(s.position(1).is_none());
        assert_eq!(s.position(2), Some(&first_b));
        assert_eq!(s.floating_pnl(), 5.5);
    }
}
