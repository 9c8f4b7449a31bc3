//! In-process push feed backed by tokio channels.
//!
//! Used for chains simulated inside the test process and for exercising
//! subscriptions without a network. Feeds are registered per contract;
//! [`ChannelConnector::publish`] delivers to every open feed for that
//! contract in publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ProbeError;
use crate::source::{EventFeed, FeedConnector, SubscriptionQuery};

struct FeedEntry {
    contract: String,
    sender: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct Inner {
    feeds: Mutex<HashMap<u64, FeedEntry>>,
    next_id: AtomicU64,
    refuse: AtomicBool,
}

/// Connector whose feeds are fed by [`ChannelConnector::publish`].
///
/// Cloning yields another handle to the same set of feeds.
#[derive(Clone)]
pub struct ChannelConnector {
    name: String,
    inner: Arc<Inner>,
}

impl ChannelConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::default(),
        }
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<u64, FeedEntry>> {
        self.inner.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `event` to every open feed subscribed to `contract`.
    ///
    /// Returns the number of feeds that received it.
    pub fn publish(&self, contract: &str, event: Value) -> usize {
        let mut feeds = self.feeds();
        feeds.retain(|_, entry| !entry.sender.is_closed());
        feeds
            .values()
            .filter(|entry| entry.contract == contract)
            .filter(|entry| entry.sender.send(event.clone()).is_ok())
            .count()
    }

    /// Drop every open feed, as if the upstream went away.
    pub fn disconnect_all(&self) {
        self.feeds().clear();
    }

    /// Make later `connect` calls fail with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of feeds still open.
    pub fn open_feeds(&self) -> usize {
        let mut feeds = self.feeds();
        feeds.retain(|_, entry| !entry.sender.is_closed());
        feeds.len()
    }
}

#[async_trait]
impl FeedConnector for ChannelConnector {
    async fn connect(&self, query: &SubscriptionQuery) -> Result<Box<dyn EventFeed>, ProbeError> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(ProbeError::connection(&self.name, "connection refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.feeds().insert(
            id,
            FeedEntry {
                contract: query.contract.clone(),
                sender: tx,
            },
        );
        tracing::debug!(feed = id, contract = %query.contract, "channel feed opened");
        Ok(Box::new(ChannelFeed { rx }))
    }

    fn endpoint(&self) -> &str {
        &self.name
    }
}

/// Receiving half of a channel subscription.
pub struct ChannelFeed {
    rx: mpsc::UnboundedReceiver<Value>,
}

#[async_trait]
impl EventFeed for ChannelFeed {
    async fn next_event(&mut self) -> Option<Result<Value, ProbeError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
