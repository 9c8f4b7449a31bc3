//! Error types shared by every chainprobe crate.

use thiserror::Error;

use crate::source::FeedStatus;

/// Errors surfaced by subscriptions, adapters and the correlator.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Upstream feed or RPC endpoint could not be reached at subscribe time.
    #[error("cannot connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// A single raw event could not be turned into an `EventRecord`.
    #[error("malformed event: {reason}")]
    Normalization { reason: String },

    /// The deadline elapsed without a matching event.
    #[error("no matching event after {waited_ms}ms ({scanned} records scanned, feed {feed})")]
    NotFound {
        waited_ms: u64,
        scanned: usize,
        feed: FeedStatus,
    },

    /// The background task did not confirm its exit within the grace period.
    #[error("background task did not stop within {grace_ms}ms")]
    ShutdownTimeout { grace_ms: u64 },

    /// The wait was aborted through its cancellation token.
    #[error("wait cancelled")]
    Cancelled,

    /// The push feed dropped and no stored record matched.
    #[error("feed disconnected: {reason}")]
    FeedDisconnected { reason: String },

    /// `subscribe` was called for a chain the harness does not know.
    #[error("unknown chain: {chain}")]
    UnknownChain { chain: String },

    /// The subscription was already closed.
    #[error("subscription closed")]
    Closed,

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// HTTP transport failure after connection was established.
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket send/receive failure after connection was established.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Payload could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl ProbeError {
    pub fn normalization(reason: impl Into<String>) -> Self {
        Self::Normalization {
            reason: reason.into(),
        }
    }

    pub fn connection(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if the event was never observed before the deadline.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if infrastructure broke, as opposed to the event being absent.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::FeedDisconnected { .. }
                | Self::Http(_)
                | Self::WebSocket(_)
                | Self::Rpc { .. }
        )
    }

    /// Returns `true` if a poll request may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::WebSocket(_))
    }
}
