use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    error::TransportError,
    types::{AccountInfo, Direction, FullSnapshot, Position, RemoteStats},
};

/// Outcome of a mutating backend call that reached the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAck {
    pub success: bool,
    pub error: Option<String>,
    pub detail: JsonValue,
}

impl CommandAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            detail: JsonValue::Null,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            detail: JsonValue::Null,
        }
    }

    /// Interprets the loosely-typed bodies the backend returns for commands.
    pub fn from_json(v: JsonValue) -> Self {
        let error = v
            .get("error")
            .and_then(|e| e.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let explicit_fail = v.get("success").and_then(|s| s.as_bool()) == Some(false);
        let partial = v
            .get("errors")
            .and_then(|e| e.as_array())
            .filter(|a| !a.is_empty())
            .map(|a| {
                a.iter()
                    .map(|x| match (x.get("ticket"), x.get("error")) {
                        (Some(t), Some(e)) => format!("#{t}: {}", e.as_str().unwrap_or("error")),
                        _ => x.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            });

        let reason = error
            .or(partial)
            .or_else(|| explicit_fail.then(|| "backend reported failure".to_string()));
        Self {
            success: reason.is_none(),
            error: reason,
            detail: v,
        }
    }

    pub fn into_result(self) -> Result<(), String> {
        if self.success {
            Ok(())
        } else {
            Err(self.error.unwrap_or_else(|| "backend reported failure".to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub lot: f64,
    pub direction: Direction,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// The trading backend as seen by the sync core. Mocked in tests.
#[async_trait]
pub trait TradingBackend: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<FullSnapshot, TransportError>;
    async fn start(&self) -> Result<CommandAck, TransportError>;
    async fn stop(&self) -> Result<CommandAck, TransportError>;
    async fn close_all(&self) -> Result<CommandAck, TransportError>;
    async fn close_position(&self, ticket: u64) -> Result<CommandAck, TransportError>;
    async fn open_order(&self, order: &OrderRequest) -> Result<CommandAck, TransportError>;
    async fn sync_history(&self, user_id: &str, days: u32) -> Result<CommandAck, TransportError>;
    async fn fetch_stats(&self, user_id: &str) -> Result<RemoteStats, TransportError>;
}

#[derive(Debug, Deserialize)]
struct StatusWire {
    bot: BotWire,
    #[serde(default)]
    account: Option<AccountInfo>,
    #[serde(default)]
    positions: Vec<PositionWire>,
    #[serde(default)]
    position_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct BotWire {
    #[serde(alias = "is_active")]
    running: bool,
    #[serde(default, alias = "mt5_connected")]
    terminal_connected: bool,
}

#[derive(Debug, Deserialize)]
struct PositionWire {
    ticket: u64,
    symbol: String,
    #[serde(rename = "type", alias = "direction")]
    direction: Direction,
    volume: f64,
    #[serde(alias = "price_open")]
    open_price: f64,
    #[serde(alias = "price_current")]
    current_price: f64,
    profit: f64,
    #[serde(default, alias = "sl")]
    stop_loss: Option<f64>,
    #[serde(default, alias = "tp")]
    take_profit: Option<f64>,
}

// The terminal reports an unset stop/target as 0.0.
fn level(x: Option<f64>) -> Option<f64> {
    x.filter(|v| v.is_finite() && *v != 0.0)
}

fn parse_status(v: JsonValue) -> Result<FullSnapshot, TransportError> {
    let wire: StatusWire =
        serde_json::from_value(v).map_err(|e| TransportError::Decode(format!("status: {e}")))?;
    let now = Utc::now();
    let positions: Vec<Position> = wire
        .positions
        .into_iter()
        .map(|p| Position {
            ticket: p.ticket,
            symbol: p.symbol,
            direction: p.direction,
            volume: p.volume,
            open_price: p.open_price,
            current_price: p.current_price,
            profit: p.profit,
            stop_loss: level(p.stop_loss),
            take_profit: level(p.take_profit),
            updated_at: now,
        })
        .collect();
    Ok(FullSnapshot {
        running: wire.bot.running,
        terminal_connected: wire.bot.terminal_connected,
        position_count: wire.position_count.unwrap_or(positions.len()),
        positions,
        account: wire.account,
    })
}

#[derive(Debug, Deserialize)]
struct StatsWire {
    #[serde(default, alias = "totalProfit")]
    total_profit: f64,
    #[serde(default, alias = "todayProfit")]
    today_profit: f64,
    #[serde(default, alias = "winRatePct", alias = "win_rate")]
    win_rate_pct: f64,
    #[serde(default, alias = "buyCount")]
    buy_count: u64,
    #[serde(default, alias = "sellCount")]
    sell_count: u64,
    #[serde(default, alias = "avgHoldSeconds")]
    avg_hold_seconds: f64,
    #[serde(default, alias = "bestPair")]
    best_pair: Option<String>,
    #[serde(default, alias = "worstPair")]
    worst_pair: Option<String>,
}

fn parse_stats(v: JsonValue) -> Result<RemoteStats, TransportError> {
    // Aggregation RPCs commonly wrap a single row in an array.
    let v = match v {
        JsonValue::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        other => other,
    };
    let w: StatsWire =
        serde_json::from_value(v).map_err(|e| TransportError::Decode(format!("stats: {e}")))?;
    Ok(RemoteStats {
        total_profit: w.total_profit,
        today_profit: w.today_profit,
        win_rate_pct: w.win_rate_pct,
        buy_count: w.buy_count,
        sell_count: w.sell_count,
        avg_hold_seconds: w.avg_hold_seconds,
        best_pair: w.best_pair,
        worst_pair: w.worst_pair,
    })
}

/// REST client for the trading backend, authenticated with a static `X-API-Key` header.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build backend http client")?;
        Ok(Self {
            client,
            base_url: api_base_url(base_url),
            api_key: api_key.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(resp: reqwest::Response) -> Result<JsonValue, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }
        Ok(resp.json::<JsonValue>().await?)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<JsonValue, TransportError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("X-API-Key", &self.api_key)
            .query(query)
            .send()
            .await?;
        Self::check(resp).await
    }

    async fn post(&self, path: &str, body: &JsonValue) -> Result<JsonValue, TransportError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-API-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::check(resp).await
    }
}

/// Accepts either `http://host:8000` or `http://host:8000/api`.
fn api_base_url(url: &str) -> String {
    let s = url.trim().trim_end_matches('/');
    if s.ends_with("/api") {
        s.to_string()
    } else {
        format!("{s}/api")
    }
}

#[async_trait]
impl TradingBackend for HttpBackend {
    async fn fetch_snapshot(&self) -> Result<FullSnapshot, TransportError> {
        parse_status(self.get("/status", &[]).await?)
    }

    async fn start(&self) -> Result<CommandAck, TransportError> {
        Ok(CommandAck::from_json(self.post("/start", &JsonValue::Null).await?))
    }

    async fn stop(&self) -> Result<CommandAck, TransportError> {
        Ok(CommandAck::from_json(self.post("/stop", &JsonValue::Null).await?))
    }

    async fn close_all(&self) -> Result<CommandAck, TransportError> {
        Ok(CommandAck::from_json(self.post("/close-all", &JsonValue::Null).await?))
    }

    async fn close_position(&self, ticket: u64) -> Result<CommandAck, TransportError> {
        let body = serde_json::json!({ "ticket": ticket });
        Ok(CommandAck::from_json(self.post("/close", &body).await?))
    }

    async fn open_order(&self, order: &OrderRequest) -> Result<CommandAck, TransportError> {
        let body = serde_json::json!({
            "symbol": order.symbol,
            "lot": order.lot,
            "direction": order.direction.wire(),
            "sl": order.stop_loss.unwrap_or(0.0),
            "tp": order.take_profit.unwrap_or(0.0),
        });
        Ok(CommandAck::from_json(self.post("/open", &body).await?))
    }

    async fn sync_history(&self, user_id: &str, days: u32) -> Result<CommandAck, TransportError> {
        let body = serde_json::json!({ "user_id": user_id, "days": days });
        Ok(CommandAck::from_json(self.post("/sync", &body).await?))
    }

    async fn fetch_stats(&self, user_id: &str) -> Result<RemoteStats, TransportError> {
        parse_stats(self.get("/stats", &[("user_id", user_id)]).await?)
    }
}
