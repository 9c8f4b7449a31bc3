//! Push adapter: one background task draining an upstream feed into a store.

use std::future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::normalize::Normalizer;
use crate::source::{EventFeed, FeedConnector, FeedStatus, SubscriptionQuery};
use crate::store::EventStore;

/// Configuration for a push subscription.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// How long `stop` waits for the background task before giving up.
    pub stop_grace: Duration,
    /// Report the feed as stalled after this long without an event.
    pub stall_after: Option<Duration>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            stall_after: Some(Duration::from_secs(30)),
        }
    }
}

/// A started push subscription.
///
/// Owns the event store, the background task and its shutdown signal.
/// Dropping the adapter without calling [`PushAdapter::stop`] cancels and
/// aborts the task synchronously.
pub struct PushAdapter {
    endpoint: String,
    store: EventStore,
    status: Arc<watch::Sender<FeedStatus>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    config: PushConfig,
}

impl PushAdapter {
    /// Connect upstream and launch the background task.
    ///
    /// Connection failures are returned here; they are never retried.
    pub async fn start(
        connector: &dyn FeedConnector,
        normalizer: Arc<dyn Normalizer>,
        query: &SubscriptionQuery,
        config: PushConfig,
    ) -> Result<Self, ProbeError> {
        let endpoint = connector.endpoint().to_string();
        let feed = connector.connect(query).await?;

        let store = EventStore::new();
        let (status, _) = watch::channel(FeedStatus::Live);
        let status = Arc::new(status);
        let shutdown = CancellationToken::new();

        tracing::info!(
            endpoint = %endpoint,
            chain = %query.chain,
            contract = %query.contract,
            "push subscription started"
        );

        let task = tokio::spawn(run_feed(FeedTask {
            feed,
            normalizer,
            store: store.clone(),
            status: status.clone(),
            shutdown: shutdown.clone(),
            stall_after: config.stall_after,
            endpoint: endpoint.clone(),
        }));

        Ok(Self {
            endpoint,
            store,
            status,
            shutdown,
            task: Mutex::new(Some(task)),
            config,
        })
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn status(&self) -> FeedStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.status.subscribe()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Stop the background task, waiting at most `stop_grace`.
    ///
    /// No record is appended after this returns. Calling it again is a no-op.
    /// If the task does not exit in time it is aborted and
    /// `ProbeError::ShutdownTimeout` is returned.
    pub async fn stop(&self) -> Result<(), ProbeError> {
        let Some(mut task) = self.take_task() else {
            return Ok(());
        };

        self.shutdown.cancel();
        self.store.seal();

        let grace = self.config.stop_grace;
        let result = match time::timeout(grace, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "feed task ended abnormally");
                Ok(())
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    endpoint = %self.endpoint,
                    grace_ms = grace.as_millis() as u64,
                    "feed task did not stop in time, aborted"
                );
                Err(ProbeError::ShutdownTimeout {
                    grace_ms: grace.as_millis() as u64,
                })
            }
        };

        self.status.send_replace(FeedStatus::Stopped);
        result
    }

    /// Synchronous release for drop paths: cancel, seal, abort.
    pub(crate) fn release_now(&self) {
        if let Some(task) = self.take_task() {
            self.shutdown.cancel();
            self.store.seal();
            task.abort();
            self.status.send_replace(FeedStatus::Stopped);
            tracing::debug!(endpoint = %self.endpoint, "feed task released without stop");
        }
    }

    /// `true` until `stop` (or a drop-path release) has run.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl Drop for PushAdapter {
    fn drop(&mut self) {
        self.release_now();
    }
}

struct FeedTask {
    feed: Box<dyn EventFeed>,
    normalizer: Arc<dyn Normalizer>,
    store: EventStore,
    status: Arc<watch::Sender<FeedStatus>>,
    shutdown: CancellationToken,
    stall_after: Option<Duration>,
    endpoint: String,
}

enum Step {
    Shutdown,
    Event(Option<Result<serde_json::Value, ProbeError>>),
    Stalled,
}

async fn run_feed(mut t: FeedTask) {
    loop {
        let stall_after = t.stall_after;
        let stall = async move {
            match stall_after {
                Some(d) => time::sleep(d).await,
                None => future::pending::<()>().await,
            }
        };

        let step = tokio::select! {
            biased;
            _ = t.shutdown.cancelled() => Step::Shutdown,
            next = t.feed.next_event() => Step::Event(next),
            _ = stall => Step::Stalled,
        };

        match step {
            Step::Shutdown => {
                t.feed.close().await;
                tracing::debug!(endpoint = %t.endpoint, "feed task stopped");
                return;
            }
            Step::Event(Some(Ok(raw))) => {
                match t.normalizer.normalize_all(&raw) {
                    Ok(records) => {
                        for record in records {
                            t.store.append(record);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %t.endpoint, error = %e, "skipping malformed event");
                    }
                }
                t.status.send_if_modified(|s| {
                    if *s == FeedStatus::Stalled {
                        *s = FeedStatus::Live;
                        true
                    } else {
                        false
                    }
                });
            }
            Step::Event(Some(Err(e @ ProbeError::Normalization { .. }))) => {
                tracing::warn!(endpoint = %t.endpoint, error = %e, "skipping malformed event");
            }
            Step::Event(Some(Err(e))) => {
                tracing::warn!(endpoint = %t.endpoint, error = %e, "feed failed, subscription degraded");
                t.status.send_replace(FeedStatus::Disconnected(e.to_string()));
                return;
            }
            Step::Event(None) => {
                tracing::warn!(endpoint = %t.endpoint, "upstream closed the feed, subscription degraded");
                t.status
                    .send_replace(FeedStatus::Disconnected("upstream closed the feed".into()));
                return;
            }
            Step::Stalled => {
                let changed = t.status.send_if_modified(|s| {
                    if *s == FeedStatus::Live {
                        *s = FeedStatus::Stalled;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    tracing::warn!(endpoint = %t.endpoint, "no events within stall threshold");
                }
            }
        }
    }
}
