use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::{
    backend::OrderRequest,
    config::Settings,
    engine::CommandNotice,
    error::CommandError,
    gateway::{CommandGateway, CommandReceipt},
    journal::Journal,
    state_store::{StateStore, SubscriptionId},
    types::{DashboardState, Direction},
    utils::now_ts,
};

#[derive(Clone)]
pub struct ApiState {
    pub settings: Settings,
    pub gateway: CommandGateway,
    pub journal: Journal,
}

pub async fn serve_dashboard(settings: Settings, gateway: CommandGateway, journal: Journal) -> Result<()> {
    let cors = cors_layer(&settings.dashboard_cors_origins);
    let state = ApiState {
        settings: settings.clone(),
        gateway,
        journal,
    };

    let app = Router::new()
        .route("/api/state", get(api_state))
        .route("/api/stats", get(api_stats))
        .route("/api/health", get(api_health))
        .route("/api/commands", get(api_commands))
        .route("/api/stream", get(api_stream))
        .route("/api/start", post(api_start))
        .route("/api/stop", post(api_stop))
        .route("/api/close", post(api_close))
        .route("/api/close-all", post(api_close_all))
        .route("/api/open", post(api_open))
        .route("/api/sync", post(api_sync))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", settings.dashboard_host, settings.dashboard_port)
        .parse()
        .with_context(|| {
            format!(
                "dashboard addr parse {}:{}",
                settings.dashboard_host, settings.dashboard_port
            )
        })?;

    log::info!("dashboard.start url=http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if list.is_empty() {
        base.allow_origin(Any)
    } else {
        base.allow_origin(AllowOrigin::list(list))
    }
}

fn command_status(e: &CommandError) -> StatusCode {
    match e {
        CommandError::AlreadyPending(_) => StatusCode::CONFLICT,
        CommandError::Rejected { .. } => StatusCode::BAD_GATEWAY,
        CommandError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CommandError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn command_error(e: CommandError) -> Response {
    (
        command_status(&e),
        Json(json!({"ok": false, "error": e.code(), "message": e.to_string()})),
    )
        .into_response()
}

#[derive(Serialize)]
struct StateView<'a> {
    #[serde(flatten)]
    state: &'a DashboardState,
    floating_pnl: f64,
}

async fn api_state(State(st): State<ApiState>) -> impl IntoResponse {
    let s = st.gateway.engine().state();
    let view = StateView {
        state: &s,
        floating_pnl: s.floating_pnl(),
    };
    Json(json!({ "ts": now_ts(), "state": view }))
}

async fn api_stats(State(st): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "ts": now_ts(),
        "stats": st.gateway.engine().stats().current(),
    }))
}

async fn api_health(State(st): State<ApiState>) -> impl IntoResponse {
    let components = st
        .journal
        .fetch_runtime_statuses()
        .unwrap_or_else(|_| json!({}));
    let s = st.gateway.engine().state();
    Json(json!({
        "ts": now_ts(),
        "initialized": s.initialized,
        "version": s.version(),
        "liveness": s.liveness,
        "components": components,
    }))
}

#[derive(Deserialize)]
struct LimitQ {
    limit: Option<usize>,
}

async fn api_commands(State(st): State<ApiState>, Query(q): Query<LimitQ>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50);
    match st.journal.fetch_recent_commands(limit) {
        Ok(rows) => Json(serde_json::Value::Array(rows)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize, Default)]
struct WaitQ {
    wait: Option<bool>,
}

/// Replies as soon as the command is registered, or after it resolves with `?wait=true`.
async fn reply(receipt: Result<CommandReceipt, CommandError>, wait: bool) -> Response {
    let receipt = match receipt {
        Ok(r) => r,
        Err(e) => return command_error(e),
    };
    let kind = receipt.kind();
    let id = receipt.id();
    if id.is_none() {
        return Json(json!({"ok": true, "kind": kind, "noop": true})).into_response();
    }
    if !wait {
        return (
            StatusCode::ACCEPTED,
            Json(json!({"ok": true, "kind": kind, "command_id": id})),
        )
            .into_response();
    }
    match receipt.confirmation().await {
        Ok(()) => Json(json!({"ok": true, "kind": kind, "command_id": id, "confirmed": true}))
            .into_response(),
        Err(e) => command_error(e),
    }
}

async fn api_start(State(st): State<ApiState>, Query(q): Query<WaitQ>) -> Response {
    reply(st.gateway.start().await, q.wait.unwrap_or(false)).await
}

async fn api_stop(State(st): State<ApiState>, Query(q): Query<WaitQ>) -> Response {
    reply(st.gateway.stop().await, q.wait.unwrap_or(false)).await
}

async fn api_close_all(State(st): State<ApiState>, Query(q): Query<WaitQ>) -> Response {
    reply(st.gateway.close_all().await, q.wait.unwrap_or(false)).await
}

#[derive(Deserialize)]
struct CloseBody {
    ticket: u64,
}

async fn api_close(
    State(st): State<ApiState>,
    Query(q): Query<WaitQ>,
    Json(body): Json<CloseBody>,
) -> Response {
    reply(st.gateway.close(body.ticket).await, q.wait.unwrap_or(false)).await
}

#[derive(Deserialize)]
struct OpenBody {
    symbol: String,
    lot: f64,
    direction: Direction,
    #[serde(default, alias = "sl")]
    stop_loss: Option<f64>,
    #[serde(default, alias = "tp")]
    take_profit: Option<f64>,
}

async fn api_open(
    State(st): State<ApiState>,
    Query(q): Query<WaitQ>,
    Json(body): Json<OpenBody>,
) -> Response {
    let order = OrderRequest {
        symbol: body.symbol,
        lot: body.lot,
        direction: body.direction,
        stop_loss: body.stop_loss,
        take_profit: body.take_profit,
    };
    reply(st.gateway.open_order(order).await, q.wait.unwrap_or(false)).await
}

#[derive(Deserialize, Default)]
struct SyncBody {
    days: Option<u32>,
}

async fn api_sync(State(st): State<ApiState>, body: Bytes) -> Response {
    let parsed: SyncBody = if body.is_empty() {
        SyncBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"ok": false, "error": "invalid_body", "message": e.to_string()})),
                )
                    .into_response()
            }
        }
    };
    let days = parsed.days.unwrap_or(st.settings.sync_days as u32);
    match st.gateway.sync(days).await {
        Ok(()) => Json(json!({"ok": true, "days": days})).into_response(),
        Err(e) => command_error(e),
    }
}

/// Unsubscribes the stream's observer when the client goes away.
struct StreamFeed {
    store: StateStore,
    sub: SubscriptionId,
    states: watch::Receiver<Arc<DashboardState>>,
    notices: broadcast::Receiver<CommandNotice>,
}

/// A slow client only ever holds the newest snapshot; intermediate ones are skipped.
fn latest_state(store: &StateStore) -> (SubscriptionId, watch::Receiver<Arc<DashboardState>>) {
    let (tx, rx) = watch::channel(store.read());
    let sub = store.subscribe(move |s| {
        tx.send_replace(s.clone());
    });
    (sub, rx)
}

impl Drop for StreamFeed {
    fn drop(&mut self) {
        self.store.unsubscribe(self.sub);
    }
}

fn sse_event<T: Serialize>(name: &str, value: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(value)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

async fn api_stream(
    State(st): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let engine = st.gateway.engine();
    let store = engine.store().clone();
    let (sub, mut states) = latest_state(&store);
    states.borrow_and_update();
    let initial = sse_event("state", &*store.read());
    let feed = StreamFeed {
        store,
        sub,
        states,
        notices: engine.notices(),
    };

    let updates = futures::stream::unfold(feed, |mut f| async move {
        loop {
            tokio::select! {
                changed = f.states.changed() => {
                    changed.ok()?;
                    let snap = f.states.borrow_and_update().clone();
                    return Some((Ok(sse_event("state", &*snap)), f));
                }
                notice = f.notices.recv() => match notice {
                    Ok(n) => return Some((Ok(sse_event("command", &n)), f)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("dashboard.stream_lagged skipped={}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    });

    let stream = futures::stream::once(async move { Ok(initial) }).chain(updates);
    Sse::new(stream).keep_alive(KeepAlive::default())
}
