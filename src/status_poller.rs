use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{backend::TradingBackend, engine::Signal};

/// Periodic full-status pull. Also wakes early when `refresh` is notified.
///
/// Each result is stamped with the instant the request was issued; failures are reported
/// and retried on the next tick, never immediately.
pub struct RemoteStatusSource {
    backend: Arc<dyn TradingBackend>,
    interval: Duration,
    refresh: Arc<Notify>,
}

impl RemoteStatusSource {
    pub fn new(backend: Arc<dyn TradingBackend>, interval: Duration, refresh: Arc<Notify>) -> Self {
        Self {
            backend,
            interval,
            refresh,
        }
    }

    pub fn spawn(self, tx: mpsc::Sender<Signal>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx, shutdown).await })
    }

    async fn run(self, tx: mpsc::Sender<Signal>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The first interval tick fires immediately, giving the eager startup pull.
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.refresh.notified() => {
                    log::debug!("poll.repull");
                    tick.reset();
                }
                _ = shutdown.changed() => break,
            }

            let signal = self.pull_once().await;
            if tx.send(signal).await.is_err() {
                break;
            }
        }
        log::info!("poll.stopped");
    }

    pub async fn pull_once(&self) -> Signal {
        let requested_at = Instant::now();
        match self.backend.fetch_snapshot().await {
            Ok(snapshot) => {
                log::debug!(
                    "poll.ok running={} positions={}",
                    snapshot.running,
                    snapshot.positions.len()
                );
                Signal::Poll {
                    snapshot,
                    requested_at,
                }
            }
            Err(e) => Signal::PollFailed {
                error: e.to_string(),
                at: requested_at,
            },
        }
    }
}
