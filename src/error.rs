// ABOUTME: Typed error taxonomy for the transport, the applier and the dispatcher
// ABOUTME: Store and file failures travel as anyhow errors with context instead

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failures talking to the message bus. Never fatal to the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("session is closed")]
    Closed,
}

/// Which list of a delta a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single row of a delta that could not be applied.
///
/// Collected in the apply report; the rest of the delta still applies.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RowError {
    #[error("malformed {kind} row (id {id:?}): {reason}")]
    MalformedRow {
        kind: ChangeKind,
        id: Option<i64>,
        reason: String,
    },

    #[error("id {id} appears in more than one list; applied the {applied}, rejected the {rejected}")]
    AmbiguousDelta {
        id: i64,
        applied: ChangeKind,
        rejected: ChangeKind,
    },
}

impl RowError {
    pub fn malformed(kind: ChangeKind, id: Option<i64>, reason: impl Into<String>) -> Self {
        RowError::MalformedRow {
            kind,
            id,
            reason: reason.into(),
        }
    }
}

/// Failures while handling one inbound message.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A payload framed as a delta did not decode.
    #[error("protocol violation: framed delta failed to decode: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("failed to apply delta: {0:#}")]
    Apply(anyhow::Error),

    #[error("failed to save file payload: {0:#}")]
    Sink(anyhow::Error),
}
