use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    backend::TradingBackend,
    error::CommandError,
    journal::Journal,
    reconciler::{Begin, Effect, Reconciler, ReconcilerSettings, Resolution},
    state_store::StateStore,
    stats::StatsAggregator,
    types::{ChangeEvent, CommandId, CommandKind, DashboardState, FullSnapshot},
    utils::now_ts,
};

const TICK: Duration = Duration::from_millis(500);
const SIGNAL_QUEUE: usize = 1024;

/// Everything the event loop reacts to, in arrival order.
#[derive(Debug)]
pub enum Signal {
    Poll {
        snapshot: FullSnapshot,
        requested_at: Instant,
    },
    PollFailed {
        error: String,
        at: Instant,
    },
    Feed {
        event: ChangeEvent,
        received_at: Instant,
    },
    FeedLink {
        connected: bool,
    },
    Begin {
        kind: CommandKind,
        ticket: Option<u64>,
        reply: oneshot::Sender<Result<Ticket, CommandError>>,
    },
    Respond {
        id: CommandId,
        result: Result<(), String>,
    },
    RefreshStats,
    Shutdown,
}

#[derive(Debug)]
pub enum Ticket {
    Issued {
        id: CommandId,
        resolution: oneshot::Receiver<Resolution>,
    },
    AlreadyInState,
}

/// Published once per resolved command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandNotice {
    pub id: CommandId,
    pub kind: CommandKind,
    pub ok: bool,
    pub error_code: Option<&'static str>,
    pub message: Option<String>,
    pub ts: DateTime<Utc>,
}

impl CommandNotice {
    fn from_resolution(r: &Resolution) -> Self {
        let (error_code, message) = match &r.outcome {
            Ok(()) => (None, None),
            Err(e) => (Some(e.code()), Some(e.to_string())),
        };
        Self {
            id: r.id,
            kind: r.kind,
            ok: r.outcome.is_ok(),
            error_code,
            message,
            ts: Utc::now(),
        }
    }
}

/// Cloneable front door to the running engine.
#[derive(Clone)]
pub struct EngineHandle {
    store: StateStore,
    stats: StatsAggregator,
    tx: mpsc::Sender<Signal>,
    refresh: Arc<Notify>,
    notices: broadcast::Sender<CommandNotice>,
}

impl EngineHandle {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn state(&self) -> Arc<DashboardState> {
        self.store.read()
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn sender(&self) -> mpsc::Sender<Signal> {
        self.tx.clone()
    }

    pub fn refresh_notify(&self) -> Arc<Notify> {
        self.refresh.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<CommandNotice> {
        self.notices.subscribe()
    }

    pub async fn refresh_stats(&self) {
        self.tx.send(Signal::RefreshStats).await.ok();
    }

    pub async fn begin(&self, kind: CommandKind) -> Result<Ticket, CommandError> {
        self.begin_with(kind, None).await
    }

    pub async fn begin_close(&self, ticket: u64) -> Result<Ticket, CommandError> {
        self.begin_with(CommandKind::ClosePosition, Some(ticket)).await
    }

    async fn begin_with(&self, kind: CommandKind, ticket: Option<u64>) -> Result<Ticket, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Signal::Begin { kind, ticket, reply })
            .await
            .map_err(|_| CommandError::EngineStopped)?;
        rx.await.map_err(|_| CommandError::EngineStopped)?
    }

    pub async fn respond(&self, id: CommandId, result: Result<(), String>) {
        if self.tx.send(Signal::Respond { id, result }).await.is_err() {
            log::warn!("command.respond_dropped id={} engine stopped", id);
        }
    }

    pub async fn shutdown(&self) {
        self.tx.send(Signal::Shutdown).await.ok();
    }
}

/// Single owner of the Reconciler. Applies signals strictly in queue order.
pub struct Engine {
    reconciler: Reconciler,
    rx: mpsc::Receiver<Signal>,
    backend: Arc<dyn TradingBackend>,
    journal: Option<Journal>,
    stats: StatsAggregator,
    refresh: Arc<Notify>,
    notices: broadcast::Sender<CommandNotice>,
    waiters: HashMap<CommandId, oneshot::Sender<Resolution>>,
    stats_seq: u64,
    user_id: String,
}

impl Engine {
    pub fn new(
        settings: ReconcilerSettings,
        backend: Arc<dyn TradingBackend>,
        journal: Option<Journal>,
        user_id: &str,
    ) -> (Self, EngineHandle) {
        let store = StateStore::new();
        let stats = StatsAggregator::new();
        stats.attach(&store);

        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE);
        let refresh = Arc::new(Notify::new());
        let (notices, _) = broadcast::channel(256);

        let handle = EngineHandle {
            store: store.clone(),
            stats: stats.clone(),
            tx,
            refresh: refresh.clone(),
            notices: notices.clone(),
        };
        let engine = Self {
            reconciler: Reconciler::new(store, settings),
            rx,
            backend,
            journal,
            stats,
            refresh,
            notices,
            waiters: HashMap::new(),
            stats_seq: 0,
            user_id: user_id.to_string(),
        };
        (engine, handle)
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.status("engine", "ok", "running", None);
        self.apply(vec![Effect::RefreshStats]);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let effects = self.reconciler.on_tick(Instant::now());
                    self.apply(effects);
                }
                signal = self.rx.recv() => {
                    let Some(signal) = signal else { break };
                    if !self.handle(signal) {
                        break;
                    }
                }
            }
        }

        self.reconciler.store().close();
        // Dropping the waiters wakes every outstanding receipt with EngineStopped.
        self.waiters.clear();
        self.status("engine", "warn", "stopped", None);
        log::info!("engine.stopped");
    }

    fn handle(&mut self, signal: Signal) -> bool {
        let effects = match signal {
            Signal::Poll {
                snapshot,
                requested_at,
            } => self.reconciler.on_poll(snapshot, requested_at),
            Signal::PollFailed { error, at } => self.reconciler.on_poll_failed(&error, at),
            Signal::Feed { event, received_at } => self.reconciler.on_feed(event, received_at),
            Signal::FeedLink { connected } => self.reconciler.on_feed_link(connected),
            Signal::Begin { kind, ticket, reply } => {
                let now = Instant::now();
                let begun = match ticket {
                    Some(t) => self.reconciler.begin_close(t, now),
                    None => self.reconciler.begin(kind, now),
                };
                let ticket = begun.map(|b| match b {
                    Begin::Issued(id) => {
                        let (tx, rx) = oneshot::channel();
                        self.waiters.insert(id, tx);
                        Ticket::Issued { id, resolution: rx }
                    }
                    Begin::AlreadyInState => Ticket::AlreadyInState,
                });
                if let Ok(Ticket::Issued { id, .. }) = &ticket {
                    self.status("commands", "ok", &format!("{} issued", kind.as_str()), Some(&id.to_string()));
                }
                if reply.send(ticket).is_err() {
                    log::debug!("command.begin_reply_dropped kind={}", kind.as_str());
                }
                Vec::new()
            }
            Signal::Respond { id, result } => self.reconciler.respond(id, result, Instant::now()),
            Signal::RefreshStats => vec![Effect::RefreshStats],
            Signal::Shutdown => return false,
        };
        self.apply(effects);
        true
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Repull => self.refresh.notify_one(),
                Effect::RefreshStats => self.spawn_stats_refresh(),
                Effect::Resolved(resolution) => self.resolve(resolution),
                Effect::Health {
                    component,
                    level,
                    message,
                } => self.status(component, level, &message, None),
            }
        }
    }

    fn resolve(&mut self, resolution: Resolution) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_command(&resolution) {
                log::warn!("journal.command_log_failed err={:#}", e);
            }
        }
        let notice = CommandNotice::from_resolution(&resolution);
        match &resolution.outcome {
            Ok(()) => self.status(
                "commands",
                "ok",
                &format!("{} confirmed", resolution.kind.as_str()),
                Some(&resolution.id.to_string()),
            ),
            Err(e) => self.status("commands", "warn", &e.to_string(), Some(&resolution.id.to_string())),
        }
        // No subscribers is fine; the receipt still gets its answer.
        let _ = self.notices.send(notice);
        if let Some(waiter) = self.waiters.remove(&resolution.id) {
            waiter.send(resolution).ok();
        }
    }

    /// Fetches run concurrently; the sequence number keeps a slow older answer from
    /// overwriting a newer one.
    fn spawn_stats_refresh(&mut self) {
        self.stats_seq += 1;
        let seq = self.stats_seq;
        let backend = self.backend.clone();
        let stats = self.stats.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            match backend.fetch_stats(&user_id).await {
                Ok(remote) => stats.set_remote(seq, remote),
                Err(e) => log::warn!("stats.fetch_failed user_id={} err={}", user_id, e),
            }
        });
    }

    fn status(&self, component: &str, level: &str, message: &str, detail: Option<&str>) {
        if let Some(journal) = &self.journal {
            journal
                .upsert_runtime_status(component, level, message, detail, now_ts())
                .ok();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{CommandAck, OrderRequest};
    use crate::error::TransportError;
    use crate::types::{Direction, Position, RemoteStats};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// In-memory backend with scripted command answers.
    pub(crate) struct ScriptedBackend {
        pub start_ack: Mutex<CommandAck>,
        pub stop_ack: Mutex<CommandAck>,
        pub close_all_ack: Mutex<CommandAck>,
        pub close_ack: Mutex<CommandAck>,
        pub open_ack: Mutex<CommandAck>,
        pub command_delay: Mutex<Duration>,
        pub calls: Mutex<Vec<&'static str>>,
        pub stats: Mutex<RemoteStats>,
    }

    impl Default for ScriptedBackend {
        fn default() -> Self {
            Self {
                start_ack: Mutex::new(CommandAck::ok()),
                stop_ack: Mutex::new(CommandAck::ok()),
                close_all_ack: Mutex::new(CommandAck::ok()),
                close_ack: Mutex::new(CommandAck::ok()),
                open_ack: Mutex::new(CommandAck::ok()),
                command_delay: Mutex::new(Duration::ZERO),
                calls: Mutex::new(Vec::new()),
                stats: Mutex::new(RemoteStats::default()),
            }
        }
    }

    impl ScriptedBackend {
        async fn command(&self, name: &'static str, ack: &Mutex<CommandAck>) -> Result<CommandAck, TransportError> {
            self.calls.lock().push(name);
            let delay = *self.command_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(ack.lock().clone())
        }
    }

    #[async_trait]
    impl TradingBackend for ScriptedBackend {
        async fn fetch_snapshot(&self) -> Result<FullSnapshot, TransportError> {
            Err(TransportError::Request("not scripted".to_string()))
        }

        async fn start(&self) -> Result<CommandAck, TransportError> {
            self.command("start", &self.start_ack).await
        }

        async fn stop(&self) -> Result<CommandAck, TransportError> {
            self.command("stop", &self.stop_ack).await
        }

        async fn close_all(&self) -> Result<CommandAck, TransportError> {
            self.command("close_all", &self.close_all_ack).await
        }

        async fn close_position(&self, _ticket: u64) -> Result<CommandAck, TransportError> {
            self.command("close_position", &self.close_ack).await
        }

        async fn open_order(&self, _order: &OrderRequest) -> Result<CommandAck, TransportError> {
            self.command("open_order", &self.open_ack).await
        }

        async fn sync_history(&self, _user_id: &str, _days: u32) -> Result<CommandAck, TransportError> {
            self.calls.lock().push("sync");
            Ok(CommandAck::ok())
        }

        async fn fetch_stats(&self, _user_id: &str) -> Result<RemoteStats, TransportError> {
            self.calls.lock().push("stats");
            Ok(self.stats.lock().clone())
        }
    }

    pub(crate) fn position(ticket: u64, profit: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            direction: Direction::Buy,
            volume: 0.1,
            open_price: 1.08,
            current_price: 1.081,
            profit,
            stop_loss: None,
            take_profit: None,
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn snapshot(running: bool, positions: Vec<Position>) -> FullSnapshot {
        FullSnapshot {
            running,
            terminal_connected: true,
            position_count: positions.len(),
            positions,
            account: None,
        }
    }

    pub(crate) fn spawn_engine(backend: Arc<ScriptedBackend>) -> EngineHandle {
        let (engine, handle) = Engine::new(ReconcilerSettings::default(), backend, None, "velocity_bot");
        tokio::spawn(engine.run());
        handle
    }

    pub(crate) async fn push_poll(handle: &EngineHandle, snap: FullSnapshot) {
        handle
            .sender()
            .send(Signal::Poll {
                snapshot: snap,
                requested_at: Instant::now(),
            })
            .await
            .unwrap();
        settle().await;
    }

    /// Lets queued signals and spawned tasks run.
    pub(crate) async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn signals_are_applied_in_order_and_stats_follow() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.stats.lock().total_profit = 42.0;
        let handle = spawn_engine(backend.clone());

        push_poll(&handle, snapshot(true, vec![position(1, 10.0)])).await;
        let s = handle.state();
        assert!(s.initialized);
        assert!(s.bot.running);
        assert_eq!(s.floating_pnl(), 10.0);

        let stats = handle.stats().current().unwrap();
        assert_eq!(stats.total_profit, 42.0);
        assert_eq!(stats.floating_pnl, 10.0);
        assert!(backend.calls.lock().contains(&"stats"));
    }

    #[tokio::test(start_paused = true)]
    async fn feed_position_event_requests_repull() {
        let handle = spawn_engine(Arc::new(ScriptedBackend::default()));
        push_poll(&handle, snapshot(false, vec![])).await;

        let refresh = handle.refresh_notify();
        handle
            .sender()
            .send(Signal::Feed {
                event: ChangeEvent {
                    table: crate::types::FeedTable::Positions,
                    kind: crate::types::ChangeKind::Insert,
                    row: Some(serde_json::json!({"ticket": 5})),
                    old_row: None,
                },
                received_at: Instant::now(),
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), refresh.notified())
            .await
            .expect("repull requested");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_store_and_fails_waiters() {
        let backend = Arc::new(ScriptedBackend::default());
        let handle = spawn_engine(backend);
        push_poll(&handle, snapshot(false, vec![])).await;
        handle.store().subscribe(|_| {});

        let Ticket::Issued { resolution, .. } = handle.begin(CommandKind::Start).await.unwrap() else {
            panic!("expected issued");
        };
        handle.shutdown().await;
        assert!(resolution.await.is_err());
        assert_eq!(handle.store().subscriber_count(), 0);
        assert_eq!(
            handle.begin(CommandKind::Stop).await.unwrap_err(),
            CommandError::EngineStopped
        );
    }
}
