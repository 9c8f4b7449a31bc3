//! Bounded wait for a matching record in a growing [`EventStore`].
//!
//! ```text
//! Searching ──match──▶ Found
//!     │
//!     ├──deadline──▶ TimedOut
//!     ├──token─────▶ Cancelled
//!     └──feed gone─▶ Disconnected
//! ```
//!
//! Each round takes a snapshot since the previous cursor and evaluates it
//! oldest first, so the first match in delivery order wins. Between rounds
//! the correlator sleeps for the next backoff delay, clipped to the time
//! left before the deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::filter::Filter;
use crate::policy::{deadline_after, Backoff, BackoffConfig};
use crate::record::EventRecord;
use crate::source::FeedStatus;
use crate::store::{Cursor, EventStore};

/// Configuration for the correlator's poll loop.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub backoff: BackoffConfig,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(250),
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    Searching,
    Found,
    TimedOut,
    Cancelled,
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct Correlator {
    config: CorrelatorConfig,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    /// Longest pause between two scans.
    pub fn max_interval(&self) -> Duration {
        Backoff::new(self.config.backoff.clone()).max_delay()
    }

    /// Wait until a record in `store` matches `filter`.
    ///
    /// `status` is consulted once per round. A zero `timeout` still scans
    /// the records already present before reporting `NotFound`.
    pub async fn wait<S>(
        &self,
        store: &EventStore,
        filter: &Filter,
        timeout: Duration,
        status: S,
        cancel: &CancellationToken,
    ) -> Result<Arc<EventRecord>, ProbeError>
    where
        S: Fn() -> FeedStatus,
    {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut cursor = Cursor::START;
        let mut scanned = 0usize;
        let mut state = CorrelationState::Searching;

        loop {
            // Status is read before the snapshot: once the feed reports
            // disconnected, every record it delivered is already stored.
            let feed = status();
            let snapshot = store.snapshot_since(cursor);
            cursor = snapshot.next_cursor();

            for record in snapshot {
                scanned += 1;
                if filter.matches(&record) {
                    transition(&mut state, CorrelationState::Found, scanned);
                    return Ok(record);
                }
            }

            if let FeedStatus::Disconnected(reason) = feed {
                transition(&mut state, CorrelationState::Disconnected, scanned);
                return Err(ProbeError::FeedDisconnected { reason });
            }

            let now = Instant::now();
            if now >= deadline {
                transition(&mut state, CorrelationState::TimedOut, scanned);
                return Err(ProbeError::NotFound {
                    waited_ms: now.duration_since(started).as_millis() as u64,
                    scanned,
                    feed,
                });
            }

            let delay = backoff.next_delay().min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    transition(&mut state, CorrelationState::Cancelled, scanned);
                    return Err(ProbeError::Cancelled);
                }
                _ = time::sleep(delay) => {}
            }
        }
    }
}

fn transition(state: &mut CorrelationState, next: CorrelationState, scanned: usize) {
    tracing::debug!(from = ?*state, to = ?next, scanned, "correlator state change");
    *state = next;
}
