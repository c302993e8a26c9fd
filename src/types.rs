use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::round2;

/// Monotonic commit stamp. Strictly increases on every accepted StateStore commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

/// Where the last accepted bot-state mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Feed,
    Poll,
    Optimistic,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Feed => "feed",
            Source::Poll => "poll",
            Source::Optimistic => "optimistic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmedBy {
    Feed,
    Poll,
    None,
}

impl From<Source> for ConfirmedBy {
    fn from(s: Source) -> Self {
        match s {
            Source::Feed => ConfirmedBy::Feed,
            Source::Poll => ConfirmedBy::Poll,
            Source::Optimistic => ConfirmedBy::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub running: bool,
    pub terminal_connected: bool,
    pub open_position_count: usize,
    pub version: Version,
    pub source: Source,
    pub last_confirmed_by: ConfirmedBy,
}

impl Default for BotState {
    fn default() -> Self {
        Self {
            running: false,
            terminal_connected: false,
            open_position_count: 0,
            version: Version(0),
            source: Source::Poll,
            last_confirmed_by: ConfirmedBy::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "BUY", alias = "Buy")]
    Buy,
    #[serde(alias = "SELL", alias = "Sell")]
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }

    pub fn wire(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Direction::Buy),
            "sell" => Ok(Direction::Sell),
            other => Err(format!("unknown direction '{other}' (expected buy|sell)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub profit: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Field equality ignoring `updated_at`.
    pub fn same_as(&self, other: &Position) -> bool {
        self.ticket == other.ticket
            && self.symbol == other.symbol
            && self.direction == other.direction
            && self.volume == other.volume
            && self.open_price == other.open_price
            && self.current_price == other.current_price
            && self.profit == other.profit
            && self.stop_loss == other.stop_loss
            && self.take_profit == other.take_profit
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub login: Option<i64>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub equity: f64,
    #[serde(default)]
    pub margin: f64,
    #[serde(default, alias = "margin_free")]
    pub free_margin: f64,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Liveness {
    pub poll_failures: u32,
    pub backend_unreachable: bool,
    pub feed_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Stop,
    CloseAll,
    ClosePosition,
    OpenOrder,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::CloseAll => "close_all",
            CommandKind::ClosePosition => "close_position",
            CommandKind::OpenOrder => "open_order",
        }
    }

    /// Start and stop share one lock; the other kinds each own theirs.
    pub fn is_toggle(&self) -> bool {
        matches!(self, CommandKind::Start | CommandKind::Stop)
    }

    pub fn conflicts_with(&self, other: CommandKind) -> bool {
        (self.is_toggle() && other.is_toggle()) || *self == other
    }

    pub fn expected_running(&self) -> Option<bool> {
        match self {
            CommandKind::Start => Some(true),
            CommandKind::Stop => Some(false),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub Uuid);

impl CommandId {
    pub fn new() -> Self {
        CommandId(Uuid::new_v4())
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingPhase {
    Issued,
    Acknowledged,
}

/// Read-only view of an outstanding command as carried in committed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingView {
    pub id: CommandId,
    pub kind: CommandKind,
    pub expected_running: Option<bool>,
    pub optimistic_version: Option<Version>,
    pub phase: PendingPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<u64>,
}

/// Immutable committed snapshot handed to every reader and observer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardState {
    pub initialized: bool,
    pub bot: BotState,
    pub positions: Vec<Position>,
    pub account: Option<AccountInfo>,
    pub liveness: Liveness,
    pub pending: Vec<PendingView>,
}

impl DashboardState {
    pub fn version(&self) -> Version {
        self.bot.version
    }

    pub fn floating_pnl(&self) -> f64 {
        round2(self.positions.iter().map(|p| p.profit).sum())
    }

    pub fn position(&self, ticket: u64) -> Option<&Position> {
        self.positions.iter().find(|p| p.ticket == ticket)
    }
}

/// Complete status as returned by one poll. Never partial.
#[derive(Debug, Clone, PartialEq)]
pub struct FullSnapshot {
    pub running: bool,
    pub terminal_connected: bool,
    pub positions: Vec<Position>,
    pub position_count: usize,
    pub account: Option<AccountInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTable {
    BotStatus,
    Positions,
    TradeHistory,
    AccountSnapshots,
    StatsInputs,
}

impl FeedTable {
    pub const ALL: [FeedTable; 5] = [
        FeedTable::BotStatus,
        FeedTable::Positions,
        FeedTable::TradeHistory,
        FeedTable::AccountSnapshots,
        FeedTable::StatsInputs,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            FeedTable::BotStatus => "bot_status",
            FeedTable::Positions => "positions",
            FeedTable::TradeHistory => "trades",
            FeedTable::AccountSnapshots => "account_snapshots",
            FeedTable::StatsInputs => "trade_logs",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        FeedTable::ALL
            .into_iter()
            .find(|t| t.table_name().eq_ignore_ascii_case(name.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: FeedTable,
    pub kind: ChangeKind,
    pub row: Option<serde_json::Value>,
    pub old_row: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Neutral,
}

/// Server-side aggregate over trade history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteStats {
    #[serde(default)]
    pub total_profit: f64,
    #[serde(default)]
    pub today_profit: f64,
    #[serde(default)]
    pub win_rate_pct: f64,
    #[serde(default)]
    pub buy_count: u64,
    #[serde(default)]
    pub sell_count: u64,
    #[serde(default)]
    pub avg_hold_seconds: f64,
    #[serde(default)]
    pub best_pair: Option<String>,
    #[serde(default)]
    pub worst_pair: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedStats {
    pub total_profit: f64,
    pub today_profit: f64,
    pub win_rate_pct: f64,
    pub buy_count: u64,
    pub sell_count: u64,
    pub avg_hold_seconds: f64,
    pub best_pair: Option<String>,
    pub worst_pair: Option<String>,
    pub floating_pnl: f64,
    pub trend: Trend,
}
