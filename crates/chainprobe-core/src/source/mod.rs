//! Event sources: the traits transports implement and the two adapters
//! built on them.
//!
//! - [`push::PushAdapter`] keeps a long-lived feed open and fills an
//!   [`EventStore`](crate::store::EventStore) from a background task.
//! - [`poll::PollAdapter`] searches an RPC endpoint by height, with no
//!   background task and no store.

pub mod channel;
pub mod poll;
pub mod push;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProbeError;
use crate::record::EventLocation;

pub use channel::{ChannelConnector, ChannelFeed};
pub use poll::{LocatedEvent, PollAdapter, PollConfig};
pub use push::{PushAdapter, PushConfig};

/// Health of a subscription's upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// Push feed connected and delivering.
    Live,
    /// Push feed connected but silent for longer than the stall threshold.
    Stalled,
    /// Push feed dropped; no further records will arrive.
    Disconnected(String),
    /// Subscription was shut down.
    Stopped,
    /// Poll-only source; there is no feed to be live or stalled.
    Polling,
}

impl FeedStatus {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Stalled => write!(f, "stalled"),
            Self::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            Self::Stopped => write!(f, "stopped"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// What a push subscription asks the upstream for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionQuery {
    pub chain: String,
    pub contract: String,
}

impl SubscriptionQuery {
    pub fn new(chain: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            contract: contract.into(),
        }
    }
}

/// Coarse server-side filter for poll sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractFilter {
    /// Emitting contract address.
    pub address: String,
    /// Event signature / topic constraints, position by position.
    pub topics: Vec<String>,
}

impl ContractFilter {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topics: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }
}

/// An open upstream subscription yielding raw payloads.
#[async_trait]
pub trait EventFeed: Send {
    /// Wait for the next raw payload.
    ///
    /// `None` means the upstream closed the stream. An
    /// `Err(ProbeError::Normalization { .. })` is a single bad frame and the
    /// feed stays usable; any other error ends the feed.
    async fn next_event(&mut self) -> Option<Result<Value, ProbeError>>;

    /// Close the upstream connection.
    async fn close(&mut self);
}

/// Opens push feeds for a chain.
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    /// Connect and subscribe. Fails with `ProbeError::Connection` if the
    /// upstream cannot be reached.
    async fn connect(&self, query: &SubscriptionQuery) -> Result<Box<dyn EventFeed>, ProbeError>;

    /// The upstream identifier (URL or name), for logs.
    fn endpoint(&self) -> &str;
}

/// Reports the current block height of a chain.
#[async_trait]
pub trait HeightOracle: Send + Sync {
    async fn current_height(&self) -> Result<u64, ProbeError>;
}

/// A raw event returned by a poll source, with its on-chain address.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub raw: Value,
    pub location: EventLocation,
}

/// Request/response access to a chain's events by height.
#[async_trait]
pub trait LogSource: HeightOracle + 'static {
    /// Events emitted in `[from, to]` that pass the coarse filter.
    async fn events_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &ContractFilter,
    ) -> Result<Vec<RawEvent>, ProbeError>;

    /// The upstream identifier (URL or name), for logs.
    fn endpoint(&self) -> &str;
}
