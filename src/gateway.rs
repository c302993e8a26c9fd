use std::sync::Arc;

use tokio::sync::oneshot;

use crate::{
    backend::{OrderRequest, TradingBackend},
    engine::{EngineHandle, Ticket},
    error::CommandError,
    reconciler::Resolution,
    types::{CommandId, CommandKind},
};

/// Handle on an issued command. Awaiting `confirmation` yields the final outcome.
#[derive(Debug)]
pub struct CommandReceipt {
    kind: CommandKind,
    id: Option<CommandId>,
    resolution: Option<oneshot::Receiver<Resolution>>,
}

impl CommandReceipt {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// `None` when the bot was already in the requested state and nothing was sent.
    pub fn id(&self) -> Option<CommandId> {
        self.id
    }

    pub async fn confirmation(self) -> Result<(), CommandError> {
        let Some(rx) = self.resolution else {
            return Ok(());
        };
        rx.await.map_err(|_| CommandError::EngineStopped)?.outcome
    }
}

/// What the backend call needs besides the command kind.
enum Payload {
    None,
    Order(OrderRequest),
    Ticket(u64),
}

/// Issues operator commands against the backend and tracks them to resolution.
#[derive(Clone)]
pub struct CommandGateway {
    engine: EngineHandle,
    backend: Arc<dyn TradingBackend>,
    user_id: String,
}

impl CommandGateway {
    pub fn new(engine: EngineHandle, backend: Arc<dyn TradingBackend>, user_id: &str) -> Self {
        Self {
            engine,
            backend,
            user_id: user_id.to_string(),
        }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub async fn start(&self) -> Result<CommandReceipt, CommandError> {
        self.issue(CommandKind::Start, Payload::None).await
    }

    pub async fn stop(&self) -> Result<CommandReceipt, CommandError> {
        self.issue(CommandKind::Stop, Payload::None).await
    }

    pub async fn close_all(&self) -> Result<CommandReceipt, CommandError> {
        self.issue(CommandKind::CloseAll, Payload::None).await
    }

    /// Closes one position. Confirmed once a later snapshot no longer holds the ticket.
    pub async fn close(&self, ticket: u64) -> Result<CommandReceipt, CommandError> {
        if ticket == 0 {
            return Err(CommandError::rejected(CommandKind::ClosePosition, "ticket is required"));
        }
        self.issue(CommandKind::ClosePosition, Payload::Ticket(ticket)).await
    }

    pub async fn open_order(&self, order: OrderRequest) -> Result<CommandReceipt, CommandError> {
        let symbol = order.symbol.trim();
        if symbol.is_empty() {
            return Err(CommandError::rejected(CommandKind::OpenOrder, "symbol is required"));
        }
        if !order.lot.is_finite() || order.lot <= 0.0 {
            return Err(CommandError::rejected(
                CommandKind::OpenOrder,
                format!("lot must be > 0 (got {})", order.lot),
            ));
        }
        let order = OrderRequest {
            symbol: symbol.to_uppercase(),
            ..order
        };
        self.issue(CommandKind::OpenOrder, Payload::Order(order)).await
    }

    /// Imports trade history for the configured user, then recomputes remote stats.
    pub async fn sync(&self, days: u32) -> Result<(), CommandError> {
        let reject = |reason: String| CommandError::Rejected {
            kind: "sync",
            reason,
        };
        log::info!("command.sync user_id={} days={}", self.user_id, days);
        let ack = self
            .backend
            .sync_history(&self.user_id, days)
            .await
            .map_err(|e| reject(e.to_string()))?;
        ack.into_result().map_err(reject)?;
        self.engine.refresh_stats().await;
        Ok(())
    }

    async fn issue(&self, kind: CommandKind, payload: Payload) -> Result<CommandReceipt, CommandError> {
        let ticket = match payload {
            Payload::Ticket(t) => self.engine.begin_close(t).await?,
            _ => self.engine.begin(kind).await?,
        };
        let (id, resolution) = match ticket {
            Ticket::AlreadyInState => {
                return Ok(CommandReceipt {
                    kind,
                    id: None,
                    resolution: None,
                })
            }
            Ticket::Issued { id, resolution } => (id, resolution),
        };

        // The optimistic state is already committed; the backend answer arrives as a signal.
        let backend = self.backend.clone();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let sent = match (kind, &payload) {
                (CommandKind::Start, _) => backend.start().await,
                (CommandKind::Stop, _) => backend.stop().await,
                (CommandKind::CloseAll, _) => backend.close_all().await,
                (CommandKind::ClosePosition, Payload::Ticket(t)) => backend.close_position(*t).await,
                (CommandKind::OpenOrder, Payload::Order(o)) => backend.open_order(o).await,
                (kind, _) => {
                    engine
                        .respond(id, Err(format!("missing payload for {}", kind.as_str())))
                        .await;
                    return;
                }
            };
            // Transport failures count as rejections: the backend never accepted the command.
            let result = match sent {
                Ok(ack) => ack.into_result(),
                Err(e) => Err(e.to_string()),
            };
            engine.respond(id, result).await;
        });

        Ok(CommandReceipt {
            kind,
            id: Some(id),
            resolution: Some(resolution),
        })
    }
}
