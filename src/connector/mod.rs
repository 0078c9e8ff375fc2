//! Remote connectors: client-side adapters that send one request to an agent
//! or tool and normalize the answer into a `Task`.
//!
//! Connectors hold no per-call state beyond a reusable HTTP client. Every call
//! is bounded by the caller's `CallControl`: exceeding the deadline yields
//! `Timeout`, firing the cancellation token yields `Canceled`.

mod a2a;
mod mcp;

pub use a2a::A2aConnector;
pub use mcp::McpConnector;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::registry::{CapabilityCard, Endpoint};
use crate::task::{Message, Task};

/// Failure category of a connector call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorErrorKind {
    Unreachable,
    Timeout,
    ProtocolError,
    RemoteTaskFailed,
    Canceled,
}

impl fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectorErrorKind::Unreachable => "unreachable",
            ConnectorErrorKind::Timeout => "timeout",
            ConnectorErrorKind::ProtocolError => "protocol error",
            ConnectorErrorKind::RemoteTaskFailed => "remote task failed",
            ConnectorErrorKind::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Typed connector failure naming the target it happened against.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{target}: {kind}: {message}")]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub target: String,
    pub message: String,
}

impl ConnectorError {
    pub fn new(kind: ConnectorErrorKind, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn unreachable(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Unreachable, target, message)
    }

    pub fn timeout(target: impl Into<String>, deadline: Duration) -> Self {
        Self::new(
            ConnectorErrorKind::Timeout,
            target,
            format!("no final answer within {:?}", deadline),
        )
    }

    pub fn protocol(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::ProtocolError, target, message)
    }

    pub fn remote_failed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::RemoteTaskFailed, target, message)
    }

    pub fn canceled(target: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Canceled, target, "call canceled")
    }

    /// Map a transport-level HTTP failure.
    pub(crate) fn from_reqwest(target: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(ConnectorErrorKind::Timeout, target, err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::unreachable(target, err.to_string())
        } else if err.is_decode() {
            Self::protocol(target, format!("undecodable response: {}", err))
        } else {
            Self::protocol(target, err.to_string())
        }
    }
}

/// Per-call deadline and cancellation.
#[derive(Debug, Clone)]
pub struct CallControl {
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl CallControl {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(deadline: Duration, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// Run `call` under this control's deadline and cancellation token.
    pub(crate) async fn bound<T, F>(&self, target: &str, call: F) -> Result<T, ConnectorError>
    where
        F: Future<Output = Result<T, ConnectorError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectorError::canceled(target)),
            res = tokio::time::timeout(self.deadline, call) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ConnectorError::timeout(target, self.deadline)),
            },
        }
    }
}

/// What to deliver to the target.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A message for an agent
    Message(Message),
    /// Arguments for a tool call
    ToolArguments(serde_json::Value),
}

/// One outbound request on behalf of a local task.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub task_id: String,
    pub session_id: String,
    pub payload: Payload,
}

/// Client-side protocol adapter for one kind of remote endpoint.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Deliver `outbound` to `target` and wait for a final or input-required answer.
    ///
    /// The returned Task carries the remote's status and the messages it
    /// produced; the caller folds them into its own task.
    async fn send(
        &self,
        target: &CapabilityCard,
        outbound: &Outbound,
        control: &CallControl,
    ) -> Result<Task, ConnectorError>;
}

/// Dispatches to the connector matching the card's endpoint.
pub struct TransportConnector {
    a2a: A2aConnector,
    mcp: McpConnector,
}

impl TransportConnector {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            a2a: A2aConnector::new(poll_interval),
            mcp: McpConnector::new(),
        }
    }
}

#[async_trait]
impl RemoteConnector for TransportConnector {
    async fn send(
        &self,
        target: &CapabilityCard,
        outbound: &Outbound,
        control: &CallControl,
    ) -> Result<Task, ConnectorError> {
        match target.endpoint {
            Endpoint::A2a { .. } => self.a2a.send(target, outbound, control).await,
            Endpoint::Mcp { .. } => self.mcp.send(target, outbound, control).await,
        }
    }
}
