use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::time::Instant;

use crate::{
    error::CommandError,
    state_store::{BotPatch, CommitOutcome, StateStore, StateUpdate},
    types::{
        AccountInfo, ChangeEvent, ChangeKind, CommandId, CommandKind, DashboardState, FeedTable,
        FullSnapshot, Liveness, PendingPhase, PendingView, Position, Source, Version,
    },
};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub command_timeout: Duration,
    pub poll_failure_threshold: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            poll_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub id: CommandId,
    pub kind: CommandKind,
    pub issued_at: Instant,
    pub expected_running: Option<bool>,
    pub optimistic_version: Option<Version>,
    pub timeout_at: Instant,
    pub phase: PendingPhase,
    pub acked_at: Option<Instant>,
    pub ticket: Option<u64>,
    prior_running: bool,
    prior_source: Source,
}

impl PendingCommand {
    fn view(&self) -> PendingView {
        PendingView {
            id: self.id,
            kind: self.kind,
            expected_running: self.expected_running,
            optimistic_version: self.optimistic_version,
            phase: self.phase,
            ticket: self.ticket,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub id: CommandId,
    pub kind: CommandKind,
    pub outcome: Result<(), CommandError>,
}

/// Work the reconciler asks its driver to perform after handling a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Repull,
    RefreshStats,
    Resolved(Resolution),
    Health {
        component: &'static str,
        level: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    Issued(CommandId),
    /// The bot already shows the requested run-state; nothing was registered.
    AlreadyInState,
}

#[derive(Debug, Clone, Copy)]
struct Confirmed {
    running: bool,
    source: Source,
    at: Instant,
}

/// Merges poll snapshots, feed events and command outcomes into the StateStore.
///
/// Precedence, in order: pending toggle supersession, receipt-time freshness,
/// command timeout, and no-op suppression (the last one lives in `StateStore::commit`).
/// Handlers never fail; anything that cannot be applied safely is logged and dropped.
pub struct Reconciler {
    store: StateStore,
    settings: ReconcilerSettings,
    pending: Vec<PendingCommand>,
    bot_flags_at: Option<Instant>,
    positions_at: Option<Instant>,
    account_at: Option<Instant>,
    last_confirmed: Option<Confirmed>,
    liveness: Liveness,
}

impl Reconciler {
    pub fn new(store: StateStore, settings: ReconcilerSettings) -> Self {
        let liveness = store.read().liveness.clone();
        Self {
            store,
            settings,
            pending: Vec::new(),
            bot_flags_at: None,
            positions_at: None,
            account_at: None,
            last_confirmed: None,
            liveness,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn pending(&self) -> &[PendingCommand] {
        &self.pending
    }

    // ---- Commands ----

    pub fn begin(&mut self, kind: CommandKind, now: Instant) -> Result<Begin, CommandError> {
        self.begin_with(kind, None, now)
    }

    /// Registers a close of one position. Closes of different tickets may run side by side.
    pub fn begin_close(&mut self, ticket: u64, now: Instant) -> Result<Begin, CommandError> {
        self.begin_with(CommandKind::ClosePosition, Some(ticket), now)
    }

    fn begin_with(
        &mut self,
        kind: CommandKind,
        ticket: Option<u64>,
        now: Instant,
    ) -> Result<Begin, CommandError> {
        if let Some(p) = self
            .pending
            .iter()
            .find(|p| p.kind.conflicts_with(kind) && p.ticket == ticket)
        {
            log::warn!(
                "command.rejected_pending kind={} in_flight={} id={}",
                kind.as_str(),
                p.kind.as_str(),
                p.id
            );
            return Err(CommandError::already_pending(kind));
        }

        let current = self.store.read();
        let expected = kind.expected_running();
        if expected == Some(current.bot.running) {
            log::info!("command.noop kind={} running={}", kind.as_str(), current.bot.running);
            return Ok(Begin::AlreadyInState);
        }

        let id = CommandId::new();
        // The reconciler is the only writer, so the optimistic commit lands on base + 1.
        let optimistic_version = expected.map(|_| current.version().next());
        self.pending.push(PendingCommand {
            id,
            kind,
            issued_at: now,
            expected_running: expected,
            optimistic_version,
            timeout_at: now + self.settings.command_timeout,
            phase: PendingPhase::Issued,
            acked_at: None,
            ticket,
            prior_running: current.bot.running,
            prior_source: current.bot.source,
        });

        let mut u = self.update(Source::Optimistic);
        if let Some(exp) = expected {
            u.bot = Some(BotPatch {
                running: Some(exp),
                ..Default::default()
            });
        }
        if self.commit(u).is_none() {
            if let Some(p) = self.pending.iter_mut().find(|p| p.id == id) {
                p.optimistic_version = None;
            }
        }
        log::info!("command.issued kind={} id={} ticket={:?}", kind.as_str(), id, ticket);
        Ok(Begin::Issued(id))
    }

    /// Backend answer for a command issued through `begin`. `Err` carries the rejection reason.
    pub fn respond(&mut self, id: CommandId, result: Result<(), String>, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(idx) = self.pending.iter().position(|p| p.id == id) else {
            log::info!("command.late_response id={} discarded", id);
            return effects;
        };

        match result {
            Err(reason) => {
                let p = self.pending.remove(idx);
                log::warn!("command.rejected kind={} id={} reason={}", p.kind.as_str(), id, reason);
                let mut u = self.update(Source::Poll);
                if let Some((patch, source)) = self.rollback_patch(&p) {
                    u.source = source;
                    u.bot = Some(patch);
                }
                self.commit(u);
                effects.push(Effect::Resolved(Resolution {
                    id,
                    kind: p.kind,
                    outcome: Err(CommandError::rejected(p.kind, reason)),
                }));
            }
            Ok(()) => match self.pending[idx].kind {
                CommandKind::OpenOrder => {
                    let p = self.pending.remove(idx);
                    log::info!("command.confirmed kind={} id={}", p.kind.as_str(), id);
                    let u = self.update(Source::Poll);
                    self.commit(u);
                    effects.push(Effect::Repull);
                    effects.push(Effect::Resolved(Resolution {
                        id,
                        kind: p.kind,
                        outcome: Ok(()),
                    }));
                }
                kind => {
                    let p = &mut self.pending[idx];
                    p.phase = PendingPhase::Acknowledged;
                    p.acked_at = Some(now);
                    log::info!("command.acknowledged kind={} id={}", kind.as_str(), id);
                    let u = self.update(Source::Poll);
                    self.commit(u);
                    if matches!(kind, CommandKind::CloseAll | CommandKind::ClosePosition) {
                        effects.push(Effect::Repull);
                    }
                }
            },
        }
        effects
    }

    /// Expires commands whose confirmation window has passed, reverting optimistic flags.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.pending.iter().any(|p| p.timeout_at <= now) {
            return effects;
        }
        let (expired, keep): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|p| p.timeout_at <= now);
        self.pending = keep;

        let mut u = self.update(Source::Poll);
        for p in expired {
            log::warn!(
                "command.timeout kind={} id={} phase={:?}",
                p.kind.as_str(),
                p.id,
                p.phase
            );
            if let Some((patch, source)) = self.rollback_patch(&p) {
                u.source = source;
                u.bot = Some(patch);
            }
            effects.push(Effect::Resolved(Resolution {
                id: p.id,
                kind: p.kind,
                outcome: Err(CommandError::timeout(p.kind)),
            }));
        }
        self.commit(u);
        effects
    }

    // ---- Poll ----

    pub fn on_poll(&mut self, snapshot: FullSnapshot, requested_at: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.liveness.poll_failures > 0 || self.liveness.backend_unreachable {
            if self.liveness.backend_unreachable {
                effects.push(Effect::Health {
                    component: "poller",
                    level: "ok",
                    message: "backend reachable again".to_string(),
                });
            }
            self.liveness.poll_failures = 0;
            self.liveness.backend_unreachable = false;
        }

        let flags = self.reconcile_running(snapshot.running, Source::Poll, requested_at, &mut effects);

        let positions_fresh = self.positions_at.map_or(true, |t| requested_at >= t);
        if positions_fresh {
            self.positions_at = Some(requested_at);
            self.resolve_closes(requested_at, &snapshot.positions, &mut effects);
        } else {
            log::debug!("reconcile.ignored_stale kind=positions source=poll");
        }

        let mut u = self.update(Source::Poll);
        u.initialize = true;
        let mut patch = BotPatch::default();
        if positions_fresh {
            patch.open_position_count = Some(snapshot.position_count);
            u.positions = Some(snapshot.positions);
        }
        if let Some(running) = flags {
            patch.running = Some(running);
            patch.terminal_connected = Some(snapshot.terminal_connected);
        }
        u.bot = Some(patch);
        if let Some(account) = snapshot.account {
            if self.account_at.map_or(true, |t| requested_at >= t) {
                self.account_at = Some(requested_at);
                u.account = Some(account);
            }
        }
        self.commit(u);
        effects
    }

    pub fn on_poll_failed(&mut self, error: &str, _at: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.liveness.poll_failures = self.liveness.poll_failures.saturating_add(1);
        log::warn!(
            "poll.failed attempt={} err={}",
            self.liveness.poll_failures,
            error
        );
        if self.liveness.poll_failures >= self.settings.poll_failure_threshold {
            if !self.liveness.backend_unreachable {
                log::error!(
                    "poll.backend_unreachable consecutive_failures={}",
                    self.liveness.poll_failures
                );
            }
            self.liveness.backend_unreachable = true;
            effects.push(Effect::Health {
                component: "poller",
                level: "error",
                message: format!(
                    "backend unreachable ({} consecutive failures): {error}",
                    self.liveness.poll_failures
                ),
            });
        } else {
            effects.push(Effect::Health {
                component: "poller",
                level: "warn",
                message: format!("poll failed: {error}"),
            });
        }
        let u = self.update(Source::Poll);
        self.commit(u);
        effects
    }

    // ---- Feed ----

    pub fn on_feed(&mut self, event: ChangeEvent, received_at: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event.table {
            FeedTable::Positions => {
                // Deletes do not carry enough to recompute P&L; always take a full snapshot.
                effects.push(Effect::Repull);
            }
            FeedTable::TradeHistory | FeedTable::StatsInputs => {
                effects.push(Effect::RefreshStats);
            }
            FeedTable::BotStatus => {
                if event.kind == ChangeKind::Delete {
                    log::debug!("feed.bot_status.delete ignored");
                    return effects;
                }
                let Some(row) = event.row else {
                    return effects;
                };
                let Some(running) = row_bool(&row, &["is_running", "running", "is_active"]) else {
                    log::warn!("feed.bot_status.missing_flag row={}", row);
                    return effects;
                };
                let terminal = row_bool(&row, &["mt5_connected", "terminal_connected"]);
                let count = row.get("position_count").and_then(|v| v.as_u64());

                let flags = self.reconcile_running(running, Source::Feed, received_at, &mut effects);
                let current = self.store.read();
                if count.is_some_and(|n| n as usize != current.positions.len()) {
                    effects.push(Effect::Repull);
                }

                let mut u = self.update(Source::Feed);
                if let Some(r) = flags {
                    u.bot = Some(BotPatch {
                        running: Some(r),
                        terminal_connected: terminal,
                        open_position_count: None,
                    });
                }
                self.commit(u);
            }
            FeedTable::AccountSnapshots => {
                if event.kind == ChangeKind::Delete {
                    return effects;
                }
                let Some(row) = event.row else {
                    return effects;
                };
                if self.account_at.is_some_and(|t| received_at < t) {
                    log::debug!("reconcile.ignored_stale kind=account source=feed");
                    return effects;
                }
                match serde_json::from_value::<AccountInfo>(row) {
                    Ok(account) => {
                        self.account_at = Some(received_at);
                        let mut u = self.update(Source::Feed);
                        u.account = Some(account);
                        self.commit(u);
                    }
                    Err(e) => log::warn!("feed.account_snapshot.decode_failed err={}", e),
                }
            }
        }
        effects
    }

    pub fn on_feed_link(&mut self, connected: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.liveness.feed_connected == connected {
            return effects;
        }
        self.liveness.feed_connected = connected;
        if connected {
            // Missed events are never assumed harmless.
            effects.push(Effect::Repull);
            effects.push(Effect::Health {
                component: "feed",
                level: "ok",
                message: "change feed connected".to_string(),
            });
        } else {
            effects.push(Effect::Health {
                component: "feed",
                level: "warn",
                message: "change feed disconnected; reconnecting".to_string(),
            });
        }
        let u = self.update(Source::Feed);
        self.commit(u);
        effects
    }

    // ---- Internals ----

    /// Applies the supersession and freshness rules to a reported run flag.
    /// Returns the value to write, or `None` when the flag must not be written.
    fn reconcile_running(
        &mut self,
        reported: bool,
        source: Source,
        at: Instant,
        effects: &mut Vec<Effect>,
    ) -> Option<bool> {
        if self.bot_flags_at.is_some_and(|t| at < t) {
            log::debug!(
                "reconcile.ignored_stale kind=bot_flags source={} running={}",
                source.as_str(),
                reported
            );
            return None;
        }
        if self.last_confirmed.map_or(true, |c| at >= c.at) {
            self.last_confirmed = Some(Confirmed {
                running: reported,
                source,
                at,
            });
        }

        if let Some(idx) = self.pending.iter().position(|p| p.kind.is_toggle()) {
            let p = &self.pending[idx];
            let expected = p.expected_running.unwrap_or(reported);
            if at < p.issued_at {
                log::debug!(
                    "reconcile.predates_command source={} id={} running={}",
                    source.as_str(),
                    p.id,
                    reported
                );
                return None;
            }
            if reported == expected {
                let p = self.pending.remove(idx);
                log::info!(
                    "command.confirmed kind={} id={} by={}",
                    p.kind.as_str(),
                    p.id,
                    source.as_str()
                );
                effects.push(Effect::Resolved(Resolution {
                    id: p.id,
                    kind: p.kind,
                    outcome: Ok(()),
                }));
            } else {
                // The remote source is authoritative even before the backend answers.
                let p = self.pending.remove(idx);
                log::warn!(
                    "command.contradicted kind={} id={} by={} running={}",
                    p.kind.as_str(),
                    p.id,
                    source.as_str(),
                    reported
                );
                effects.push(Effect::Resolved(Resolution {
                    id: p.id,
                    kind: p.kind,
                    outcome: Err(CommandError::rejected(
                        p.kind,
                        format!("{} reports running={}", source.as_str(), reported),
                    )),
                }));
            }
        }

        self.bot_flags_at = Some(at);
        Some(reported)
    }

    /// Confirms acknowledged closes once a snapshot requested after the ack no longer holds
    /// their positions.
    fn resolve_closes(&mut self, snapshot_at: Instant, held: &[Position], effects: &mut Vec<Effect>) {
        let (done, keep): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| {
            let gone = match p.kind {
                CommandKind::CloseAll => held.is_empty(),
                CommandKind::ClosePosition => p
                    .ticket
                    .is_some_and(|t| !held.iter().any(|h| h.ticket == t)),
                _ => return false,
            };
            gone && p.phase == PendingPhase::Acknowledged
                && p.acked_at.is_some_and(|t| snapshot_at >= t)
        });
        self.pending = keep;
        for p in done {
            log::info!(
                "command.confirmed kind={} id={} ticket={:?} by=poll",
                p.kind.as_str(),
                p.id,
                p.ticket
            );
            effects.push(Effect::Resolved(Resolution {
                id: p.id,
                kind: p.kind,
                outcome: Ok(()),
            }));
        }
    }

    /// The most recent confirmed non-optimistic run flag, or the pre-command value.
    fn rollback_patch(&self, p: &PendingCommand) -> Option<(BotPatch, Source)> {
        p.expected_running?;
        let (running, source) = match self.last_confirmed {
            Some(c) => (c.running, c.source),
            None => (p.prior_running, p.prior_source),
        };
        log::info!(
            "command.rollback kind={} id={} running={} source={}",
            p.kind.as_str(),
            p.id,
            running,
            source.as_str()
        );
        Some((
            BotPatch {
                running: Some(running),
                ..Default::default()
            },
            source,
        ))
    }

    fn update(&self, source: Source) -> StateUpdate {
        let mut u = StateUpdate::new(self.store.read().version(), source);
        u.pending = Some(self.pending.iter().map(PendingCommand::view).collect());
        u.liveness = Some(self.liveness.clone());
        u
    }

    fn commit(&self, u: StateUpdate) -> Option<Arc<DashboardState>> {
        match self.store.commit(u) {
            CommitOutcome::Committed(s) => Some(s),
            CommitOutcome::Unchanged => None,
            CommitOutcome::Stale { current } => {
                log::warn!("reconcile.stale_commit current={}", current.0);
                None
            }
        }
    }
}

fn row_bool(row: &JsonValue, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| match row.get(*k)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|x| x != 0),
        JsonValue::String(s) => match s.to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pos(ticket: u64, profit: f64) -> Position {
        Position {
            ticket,
            symbol: "XAUUSD".to_string(),
            direction: Direction::Sell,
            volume: 0.01,
            open_price: 2300.0,
            current_price: 2299.0,
            profit,
            stop_loss: Some(2310.0),
            take_profit: None,
            updated_at: Utc::now(),
        }
    }

    fn snap(running: bool, positions: Vec<Position>) -> FullSnapshot {
        FullSnapshot {
            running,
            terminal_connected: true,
            position_count: positions.len(),
            positions,
            account: None,
        }
    }

    fn bot_row(running: bool) -> ChangeEvent {
        ChangeEvent {
            table: FeedTable::BotStatus,
            kind: ChangeKind::Update,
            row: Some(json!({"user_id": "velocity_bot", "is_running": running, "open_pl": 0.0})),
            old_row: None,
        }
    }

    fn setup(t0: Instant) -> Reconciler {
        let mut r = Reconciler::new(StateStore::new(), ReconcilerSettings::default());
        r.on_poll(snap(false, vec![]), t0);
        r
    }

    fn resolutions(effects: &[Effect]) -> Vec<&Resolution> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Resolved(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn start_then_poll_confirmation() {
        let t0 = Instant::now();
        let mut r = setup(t0);

        let Begin::Issued(id) = r.begin(CommandKind::Start, t0 + secs(1)).unwrap() else {
            panic!("expected issued");
        };
        let s = r.store().read();
        assert!(s.bot.running);
        assert_eq!(s.bot.source, Source::Optimistic);
        assert_eq!(s.pending.len(), 1);
        assert_eq!(s.pending[0].optimistic_version, Some(Version(2)));

        assert!(r.respond(id, Ok(()), t0 + secs(2)).is_empty());
        let effects = r.on_poll(snap(true, vec![]), t0 + secs(5));
        let res = resolutions(&effects);
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].outcome, Ok(()));

        let s = r.store().read();
        assert!(s.bot.running);
        assert_eq!(s.bot.source, Source::Poll);
        assert!(s.pending.is_empty());
        assert!(r.pending().is_empty());
    }

    #[test]
    fn start_then_feed_confirmation_leaves_feed_source() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let Begin::Issued(id) = r.begin(CommandKind::Start, t0 + secs(1)).unwrap() else {
            panic!("expected issued");
        };
        r.respond(id, Ok(()), t0 + secs(1));
        let effects = r.on_feed(bot_row(true), t0 + secs(2));
        assert_eq!(resolutions(&effects)[0].outcome, Ok(()));
        let s = r.store().read();
        assert_eq!(s.bot.source, Source::Feed);
        assert_eq!(s.bot.last_confirmed_by, crate::types::ConfirmedBy::Feed);
    }

    #[test]
    fn rejection_restores_prior_flag_with_one_error() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let before = r.store().read();
        let Begin::Issued(id) = r.begin(CommandKind::Start, t0 + secs(1)).unwrap() else {
            panic!("expected issued");
        };
        let effects = r.respond(id, Err("Failed to connect to MT5".into()), t0 + secs(1));
        let res = resolutions(&effects);
        assert_eq!(res.len(), 1);
        assert!(matches!(res[0].outcome, Err(CommandError::Rejected { .. })));

        let s = r.store().read();
        assert_eq!(s.bot.running, before.bot.running);
        assert_eq!(s.bot.source, Source::Poll);
        assert!(s.pending.is_empty());

        // The late duplicate is discarded.
        assert!(r.respond(id, Err("again".into()), t0 + secs(2)).is_empty());
    }

    #[test]
    fn stop_without_confirmation_times_out_and_reverts() {
        let t0 = Instant::now();
        let mut r = Reconciler::new(StateStore::new(), ReconcilerSettings::default());
        r.on_poll(snap(true, vec![]), t0);

        let Begin::Issued(id) = r.begin(CommandKind::Stop, t0 + secs(1)).unwrap() else {
            panic!("expected issued");
        };
        r.respond(id, Ok(()), t0 + secs(1));
        assert!(!r.store().read().bot.running);

        assert!(r.on_tick(t0 + secs(10)).is_empty());
        let effects = r.on_tick(t0 + secs(11));
        let res = resolutions(&effects);
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].outcome, Err(CommandError::timeout(CommandKind::Stop)));

        let s = r.store().read();
        assert!(s.bot.running);
        assert_ne!(s.bot.source, Source::Optimistic);
        assert!(s.pending.is_empty());
    }

    #[test]
    fn second_toggle_is_rejected_without_state_change() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        r.begin(CommandKind::Start, t0).unwrap();
        let version = r.store().read().version();
        assert_eq!(
            r.begin(CommandKind::Stop, t0),
            Err(CommandError::already_pending(CommandKind::Stop))
        );
        assert_eq!(r.store().read().version(), version);
        // Independent kinds still go through.
        assert!(matches!(r.begin(CommandKind::CloseAll, t0), Ok(Begin::Issued(_))));
        assert!(matches!(r.begin(CommandKind::OpenOrder, t0), Ok(Begin::Issued(_))));
        assert!(r.begin(CommandKind::OpenOrder, t0).is_err());
    }

    #[test]
    fn start_when_running_is_a_noop() {
        let t0 = Instant::now();
        let mut r = Reconciler::new(StateStore::new(), ReconcilerSettings::default());
        r.on_poll(snap(true, vec![]), t0);
        let version = r.store().read().version();
        assert_eq!(r.begin(CommandKind::Start, t0), Ok(Begin::AlreadyInState));
        assert_eq!(r.store().read().version(), version);
        assert!(r.pending().is_empty());
    }

    #[test]
    fn contradiction_before_ack_is_applied_and_fails_command() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let Begin::Issued(id) = r.begin(CommandKind::Start, t0 + secs(1)).unwrap() else {
            panic!("expected issued");
        };

        let effects = r.on_feed(bot_row(false), t0 + secs(2));
        let res = resolutions(&effects);
        assert_eq!(res.len(), 1);
        assert!(matches!(res[0].outcome, Err(CommandError::Rejected { .. })));
        let s = r.store().read();
        assert!(!s.bot.running);
        assert_eq!(s.bot.source, Source::Feed);
        assert!(s.pending.is_empty());

        // The backend ack that trails the contradiction is discarded.
        assert!(r.respond(id, Ok(()), t0 + secs(3)).is_empty());
    }

    #[test]
    fn contradiction_after_ack_is_applied_and_fails_command() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let Begin::Issued(id) = r.begin(CommandKind::Start, t0 + secs(1)).unwrap() else {
            panic!("expected issued");
        };

        r.respond(id, Ok(()), t0 + secs(3));
        let effects = r.on_poll(snap(false, vec![]), t0 + secs(4));
        let res = resolutions(&effects);
        assert_eq!(res.len(), 1);
        assert!(matches!(res[0].outcome, Err(CommandError::Rejected { .. })));
        let s = r.store().read();
        assert!(!s.bot.running);
        assert_eq!(s.bot.source, Source::Poll);
    }

    #[test]
    fn poll_issued_before_command_does_not_resolve_it() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let Begin::Issued(id) = r.begin(CommandKind::Start, t0 + secs(2)).unwrap() else {
            panic!("expected issued");
        };
        r.respond(id, Ok(()), t0 + secs(2));
        let effects = r.on_poll(snap(false, vec![]), t0 + secs(1));
        assert!(resolutions(&effects).is_empty());
        let s = r.store().read();
        assert!(s.bot.running);
        assert_eq!(s.bot.source, Source::Optimistic);
        assert_eq!(r.pending().len(), 1);
    }

    #[test]
    fn older_poll_loses_to_newer_feed_flags() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        r.on_feed(bot_row(true), t0 + secs(3));
        r.on_poll(snap(false, vec![pos(7, 1.0)]), t0 + secs(2));
        let s = r.store().read();
        assert!(s.bot.running);
        assert_eq!(s.bot.source, Source::Feed);
        // Positions still come from the snapshot.
        assert_eq!(s.positions.len(), 1);
    }

    #[test]
    fn rollback_prefers_latest_confirmed_value() {
        let t0 = Instant::now();
        let mut r = Reconciler::new(StateStore::new(), ReconcilerSettings::default());
        r.on_poll(snap(true, vec![]), t0);
        let Begin::Issued(_) = r.begin(CommandKind::Stop, t0 + secs(3)).unwrap() else {
            panic!("expected issued");
        };
        // Requested before the stop was issued: not applied, but remembered.
        let effects = r.on_poll(snap(false, vec![]), t0 + secs(2));
        assert!(resolutions(&effects).is_empty());
        assert!(!r.store().read().bot.running);

        r.on_tick(t0 + secs(14));
        let s = r.store().read();
        assert!(!s.bot.running);
        assert_eq!(s.bot.source, Source::Poll);
        assert!(s.pending.is_empty());
    }

    #[test]
    fn repeated_identical_polls_notify_once() {
        let t0 = Instant::now();
        let store = StateStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let mut r = Reconciler::new(store, ReconcilerSettings::default());
        r.on_poll(snap(true, vec![pos(1, 3.0)]), t0);
        r.on_poll(snap(true, vec![pos(1, 3.0)]), t0 + secs(5));
        r.on_feed(bot_row(true), t0 + secs(6));
        r.on_feed(bot_row(true), t0 + secs(7));
        // poll commit + one feed source change.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn snapshot_replacement_recomputes_floating_pnl() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        r.on_poll(snap(true, vec![pos(1, 12.5), pos(2, -2.0)]), t0 + secs(5));
        assert_eq!(r.store().read().floating_pnl(), 10.5);
        let b = r.store().read().position(2).cloned().unwrap();

        r.on_poll(snap(true, vec![pos(2, -2.0)]), t0 + secs(10));
        let s = r.store().read();
        assert!(s.position(1).is_none());
        let b_now = s.position(2).unwrap();
        assert!(b_now.same_as(&b));
        assert_eq!(b_now.updated_at, b.updated_at);
        assert_eq!(s.floating_pnl(), -2.0);
        assert_eq!(s.bot.open_position_count, 1);
    }

    #[test]
    fn close_all_resolves_when_snapshot_is_empty() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        r.on_poll(snap(true, vec![pos(1, 1.0), pos(2, 2.0)]), t0 + secs(1));
        let Begin::Issued(id) = r.begin(CommandKind::CloseAll, t0 + secs(2)).unwrap() else {
            panic!("expected issued");
        };
        // No optimistic bot change.
        assert_eq!(r.store().read().bot.source, Source::Poll);
        let effects = r.respond(id, Ok(()), t0 + secs(3));
        assert_eq!(effects, vec![Effect::Repull]);

        let effects = r.on_poll(snap(true, vec![pos(2, 2.0)]), t0 + secs(4));
        assert!(resolutions(&effects).is_empty());
        let effects = r.on_poll(snap(true, vec![]), t0 + secs(5));
        assert_eq!(resolutions(&effects)[0].outcome, Ok(()));
        assert!(r.pending().is_empty());
    }

    #[test]
    fn close_position_resolves_when_ticket_leaves_snapshot() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        r.on_poll(snap(true, vec![pos(1, 1.0), pos(2, 2.0)]), t0 + secs(1));
        let Begin::Issued(id) = r.begin_close(1, t0 + secs(2)).unwrap() else {
            panic!("expected issued");
        };
        assert_eq!(r.store().read().pending[0].ticket, Some(1));
        // Another ticket may close concurrently; the same one may not.
        assert!(matches!(r.begin_close(2, t0 + secs(2)), Ok(Begin::Issued(_))));
        assert_eq!(
            r.begin_close(1, t0 + secs(2)),
            Err(CommandError::already_pending(CommandKind::ClosePosition))
        );

        // A snapshot requested before the ack cannot confirm it.
        assert_eq!(r.respond(id, Ok(()), t0 + secs(4)), vec![Effect::Repull]);
        let effects = r.on_poll(snap(true, vec![pos(2, 2.0)]), t0 + secs(3));
        assert!(resolutions(&effects).is_empty());

        let effects = r.on_poll(snap(true, vec![pos(2, 2.0)]), t0 + secs(5));
        let res = resolutions(&effects);
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, id);
        assert_eq!(res[0].outcome, Ok(()));
        assert_eq!(r.pending().len(), 1);
        assert_eq!(r.pending()[0].ticket, Some(2));
    }

    #[test]
    fn unconfirmed_close_position_times_out_without_touching_run_flag() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        r.on_poll(snap(true, vec![pos(9, -3.0)]), t0 + secs(1));
        let Begin::Issued(id) = r.begin_close(9, t0 + secs(2)).unwrap() else {
            panic!("expected issued");
        };
        r.respond(id, Ok(()), t0 + secs(2));
        r.on_poll(snap(true, vec![pos(9, -3.5)]), t0 + secs(5));
        let effects = r.on_tick(t0 + secs(12));
        assert_eq!(
            resolutions(&effects)[0].outcome,
            Err(CommandError::timeout(CommandKind::ClosePosition))
        );
        let s = r.store().read();
        assert!(s.bot.running);
        assert_eq!(s.positions.len(), 1);
    }

    #[test]
    fn open_order_success_requests_repull() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let Begin::Issued(id) = r.begin(CommandKind::OpenOrder, t0).unwrap() else {
            panic!("expected issued");
        };
        let effects = r.respond(id, Ok(()), t0 + secs(1));
        assert_eq!(effects[0], Effect::Repull);
        assert_eq!(resolutions(&effects)[0].outcome, Ok(()));
    }

    #[test]
    fn poll_failures_escalate_without_clearing_data() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        r.on_poll(snap(true, vec![pos(1, 4.0)]), t0 + secs(1));
        for i in 0..2 {
            r.on_poll_failed("connection refused", t0 + secs(5 * (i + 2)));
            assert!(!r.store().read().liveness.backend_unreachable);
        }
        let effects = r.on_poll_failed("connection refused", t0 + secs(20));
        assert!(matches!(
            effects[0],
            Effect::Health { level: "error", .. }
        ));
        let s = r.store().read();
        assert!(s.liveness.backend_unreachable);
        assert_eq!(s.liveness.poll_failures, 3);
        assert_eq!(s.positions.len(), 1);
        assert!(s.bot.running);

        r.on_poll(snap(true, vec![pos(1, 4.0)]), t0 + secs(25));
        let s = r.store().read();
        assert!(!s.liveness.backend_unreachable);
        assert_eq!(s.liveness.poll_failures, 0);
    }

    #[test]
    fn feed_routing() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let ev = |table, kind| ChangeEvent {
            table,
            kind,
            row: None,
            old_row: Some(json!({"ticket": 1})),
        };
        assert_eq!(
            r.on_feed(ev(FeedTable::Positions, ChangeKind::Delete), t0),
            vec![Effect::Repull]
        );
        assert_eq!(
            r.on_feed(ev(FeedTable::TradeHistory, ChangeKind::Insert), t0),
            vec![Effect::RefreshStats]
        );

        let account = ChangeEvent {
            table: FeedTable::AccountSnapshots,
            kind: ChangeKind::Insert,
            row: Some(json!({"balance": 1000.0, "equity": 1012.5, "currency": "USD"})),
            old_row: None,
        };
        r.on_feed(account, t0 + secs(1));
        let s = r.store().read();
        assert_eq!(s.account.as_ref().map(|a| a.equity), Some(1012.5));

        // Count mismatch against the held set triggers a pull.
        let row = ChangeEvent {
            table: FeedTable::BotStatus,
            kind: ChangeKind::Update,
            row: Some(json!({"is_running": false, "position_count": 2})),
            old_row: None,
        };
        assert!(r.on_feed(row, t0 + secs(2)).contains(&Effect::Repull));
    }

    #[test]
    fn feed_reconnect_forces_full_pull() {
        let t0 = Instant::now();
        let mut r = setup(t0);
        let effects = r.on_feed_link(true);
        assert!(effects.contains(&Effect::Repull));
        assert!(r.store().read().liveness.feed_connected);
        assert!(r.on_feed_link(true).is_empty());
        let effects = r.on_feed_link(false);
        assert!(!effects.contains(&Effect::Repull));
        assert!(!r.store().read().liveness.feed_connected);
    }

    #[test]
    fn observed_versions_strictly_increase_across_a_session() {
        let t0 = Instant::now();
        let store = StateStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        store.subscribe(move |snap| s.lock().push(snap.version()));
        let mut r = Reconciler::new(store, ReconcilerSettings::default());
        r.on_poll(snap(false, vec![pos(1, 1.0)]), t0);
        if let Ok(Begin::Issued(id)) = r.begin(CommandKind::Start, t0 + secs(1)) {
            r.respond(id, Ok(()), t0 + secs(1));
        }
        r.on_feed_link(true);
        r.on_feed(bot_row(true), t0 + secs(2));
        r.on_poll_failed("timeout", t0 + secs(3));
        r.on_poll(snap(true, vec![]), t0 + secs(4));
        let seen = seen.lock();
        assert!(seen.len() >= 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
