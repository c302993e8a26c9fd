use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    config::Settings,
    engine::Signal,
    types::{ChangeEvent, ChangeKind, FeedTable},
    utils::backoff_delay,
};

const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Decoded realtime frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Change(ChangeEvent),
    JoinReply { topic: String, ok: bool },
    HeartbeatReply { msg_ref: u64 },
    ChannelError { topic: String },
    Ignored,
}

/// Phoenix-channel realtime client for the trading store's row changes.
///
/// Never exits on its own: disconnects are reported as `FeedLink { connected: false }`
/// and the socket is re-established with jittered exponential backoff.
#[derive(Debug, Clone)]
pub struct ChangeFeedSource {
    url: String,
    api_key: String,
    user_id: String,
    heartbeat: Duration,
    max_backoff: Duration,
}

impl ChangeFeedSource {
    pub fn new(settings: &Settings) -> Self {
        Self {
            url: settings.feed_ws_url.clone(),
            api_key: settings.feed_api_key.clone(),
            user_id: settings.user_id.clone(),
            heartbeat: settings.feed_heartbeat(),
            max_backoff: settings.feed_max_backoff(),
        }
    }

    pub fn spawn(self, tx: mpsc::Sender<Signal>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx, shutdown).await })
    }

    async fn run(self, tx: mpsc::Sender<Signal>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            let mut connected = false;
            let result = tokio::select! {
                r = self.connect_and_stream(&tx, &mut connected) => r,
                _ = shutdown.changed() => return,
            };
            if connected {
                attempt = 0;
                if tx.send(Signal::FeedLink { connected: false }).await.is_err() {
                    return;
                }
            }
            let delay = backoff_delay(attempt, BACKOFF_BASE, self.max_backoff);
            attempt = attempt.saturating_add(1);
            match result {
                Ok(()) => log::info!(
                    "feed.closed reconnect_in_ms={}",
                    delay.as_millis()
                ),
                Err(e) => log::warn!(
                    "feed.error attempt={} reconnect_in_ms={} err={:#}",
                    attempt,
                    delay.as_millis(),
                    e
                ),
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn connect_and_stream(&self, tx: &mpsc::Sender<Signal>, connected: &mut bool) -> Result<()> {
        let url = socket_url(&self.url, &self.api_key);
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connect {}", self.url))?;
        log::info!("feed.connected url={}", self.url);

        let mut next_ref: u64 = 0;
        for table in FeedTable::ALL {
            next_ref += 1;
            let msg = join_message(table, &self.user_id, next_ref);
            ws.send(Message::Text(msg.to_string().into())).await?;
        }

        *connected = true;
        tx.send(Signal::FeedLink { connected: true })
            .await
            .map_err(|_| anyhow!("engine stopped"))?;

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut beats = HeartbeatWatch::default();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    next_ref += 1;
                    beats.on_tick(next_ref)?;
                    ws.send(Message::Text(heartbeat_message(next_ref).to_string().into())).await?;
                }
                msg = ws.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    match msg? {
                        Message::Text(text) => match parse_frame(&text) {
                            FeedFrame::Change(event) => {
                                let received_at = Instant::now();
                                log::debug!(
                                    "feed.event table={} kind={:?}",
                                    event.table.table_name(),
                                    event.kind
                                );
                                tx.send(Signal::Feed { event, received_at })
                                    .await
                                    .map_err(|_| anyhow!("engine stopped"))?;
                            }
                            FeedFrame::JoinReply { topic, ok: false } => {
                                log::warn!("feed.join_rejected topic={}", topic);
                            }
                            FeedFrame::ChannelError { topic } => {
                                return Err(anyhow!("channel error on {topic}"));
                            }
                            FeedFrame::HeartbeatReply { msg_ref } => beats.on_reply(msg_ref),
                            FeedFrame::JoinReply { .. } | FeedFrame::Ignored => {}
                        },
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Tracks the outstanding heartbeat. A tick that finds the previous one unanswered
/// means the socket is half-open.
#[derive(Debug, Default)]
struct HeartbeatWatch {
    pending: Option<u64>,
}

impl HeartbeatWatch {
    fn on_tick(&mut self, msg_ref: u64) -> Result<()> {
        if let Some(missed) = self.pending {
            return Err(anyhow!("heartbeat ref={missed} unanswered"));
        }
        self.pending = Some(msg_ref);
        Ok(())
    }

    fn on_reply(&mut self, msg_ref: u64) {
        if self.pending == Some(msg_ref) {
            self.pending = None;
        }
    }
}

fn topic(table: FeedTable) -> String {
    format!("realtime:public:{}", table.table_name())
}

pub fn socket_url(base: &str, api_key: &str) -> String {
    let (path, query) = match base.trim().split_once('?') {
        Some((p, q)) => (p, q),
        None => (base.trim(), ""),
    };
    let path = path.trim_end_matches('/');
    let mut url = if path.ends_with("/websocket") {
        path.to_string()
    } else {
        format!("{path}/websocket")
    };
    let mut params: Vec<String> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if !params.iter().any(|p| p.starts_with("vsn=")) {
        params.push("vsn=1.0.0".to_string());
    }
    if !api_key.is_empty() && !params.iter().any(|p| p.starts_with("apikey=")) {
        params.push(format!("apikey={api_key}"));
    }
    url.push('?');
    url.push_str(&params.join("&"));
    url
}

pub fn join_message(table: FeedTable, user_id: &str, msg_ref: u64) -> JsonValue {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": table.table_name(),
    });
    // Only bot_status rows are keyed by user.
    if table == FeedTable::BotStatus && !user_id.is_empty() {
        change["filter"] = json!(format!("user_id=eq.{user_id}"));
    }
    json!({
        "topic": topic(table),
        "event": "phx_join",
        "payload": { "config": { "postgres_changes": [change] } },
        "ref": msg_ref.to_string(),
    })
}

pub fn heartbeat_message(msg_ref: u64) -> JsonValue {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

pub fn parse_frame(text: &str) -> FeedFrame {
    let Ok(v) = serde_json::from_str::<JsonValue>(text) else {
        log::debug!("feed.malformed_frame len={}", text.len());
        return FeedFrame::Ignored;
    };
    let event = v.get("event").and_then(|e| e.as_str()).unwrap_or_default();
    let topic = v
        .get("topic")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    let payload = v.get("payload").cloned().unwrap_or(JsonValue::Null);

    match event {
        "phx_reply" => {
            if topic == "phoenix" {
                return v
                    .get("ref")
                    .and_then(|r| r.as_str())
                    .and_then(|r| r.parse().ok())
                    .map_or(FeedFrame::Ignored, |msg_ref| FeedFrame::HeartbeatReply { msg_ref });
            }
            let ok = payload.get("status").and_then(|s| s.as_str()) == Some("ok");
            FeedFrame::JoinReply { topic, ok }
        }
        "phx_error" | "phx_close" => FeedFrame::ChannelError { topic },
        "postgres_changes" => {
            // Newer servers nest the row change under `data`.
            let data = payload.get("data").unwrap_or(&payload);
            change_event(data).map_or(FeedFrame::Ignored, FeedFrame::Change)
        }
        "INSERT" | "UPDATE" | "DELETE" => {
            change_event(&payload).map_or(FeedFrame::Ignored, FeedFrame::Change)
        }
        _ => FeedFrame::Ignored,
    }
}

fn change_event(data: &JsonValue) -> Option<ChangeEvent> {
    let table = data
        .get("table")
        .and_then(|t| t.as_str())
        .and_then(FeedTable::from_name)?;
    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(|t| t.as_str())
        .and_then(ChangeKind::parse)?;
    let row = non_empty(data.get("record").or_else(|| data.get("new")));
    let old_row = non_empty(data.get("old_record").or_else(|| data.get("old")));
    Some(ChangeEvent {
        table,
        kind,
        row,
        old_row,
    })
}

fn non_empty(v: Option<&JsonValue>) -> Option<JsonValue> {
    match v? {
        JsonValue::Null => None,
        JsonValue::Object(m) if m.is_empty() => None,
        other => Some(other.clone()),
    }
}
