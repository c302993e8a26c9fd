use thiserror::Error;

use crate::types::CommandKind;

/// Poll or feed connectivity failure. Absorbed and retried on schedule.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Command-level failures. Always surfaced to whoever issued the command.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("a {0} command is already in flight")]
    AlreadyPending(&'static str),
    #[error("backend rejected {kind}: {reason}")]
    Rejected { kind: &'static str, reason: String },
    #[error("{0} was not confirmed before the timeout")]
    Timeout(&'static str),
    #[error("sync engine is not running")]
    EngineStopped,
}

impl CommandError {
    pub fn already_pending(kind: CommandKind) -> Self {
        CommandError::AlreadyPending(kind.as_str())
    }

    pub fn rejected(kind: CommandKind, reason: impl Into<String>) -> Self {
        CommandError::Rejected {
            kind: kind.as_str(),
            reason: reason.into(),
        }
    }

    pub fn timeout(kind: CommandKind) -> Self {
        CommandError::Timeout(kind.as_str())
    }

    pub fn code(&self) -> &'static str {
        match self {
            CommandError::AlreadyPending(_) => "already_pending",
            CommandError::Rejected { .. } => "command_rejected",
            CommandError::Timeout(_) => "command_timeout",
            CommandError::EngineStopped => "engine_stopped",
        }
    }
}
