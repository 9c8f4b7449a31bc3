//! Poll adapter: a self-contained, bounded search by height.
//!
//! Each `locate` call walks forward from a start height in `max_range`
//! chunks, asking the source for events that pass the coarse contract
//! filter and applying the [`Filter`] client-side. Heights already scanned
//! are never requested again within one call. Between rounds the adapter
//! sleeps on a backoff timer; every round races the deadline and the
//! cancellation token.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::filter::Filter;
use crate::normalize::Normalizer;
use crate::policy::{deadline_after, Backoff, BackoffConfig, RetryConfig};
use crate::record::{EventLocation, EventRecord};
use crate::source::{ContractFilter, FeedStatus, LogSource};

/// Configuration for poll-based lookups.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay schedule between search rounds.
    pub interval: BackoffConfig,
    /// Largest height range requested in one call.
    pub max_range: u64,
    /// Budget for transient RPC failures within one `locate`.
    pub retry: RetryConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: BackoffConfig {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(2),
                multiplier: 1.5,
            },
            max_range: 100,
            retry: RetryConfig::default(),
        }
    }
}

/// A poll match with its on-chain address.
#[derive(Debug, Clone)]
pub struct LocatedEvent {
    /// The payload exactly as the source returned it.
    pub raw: Value,
    pub record: EventRecord,
    pub location: EventLocation,
}

/// Height-indexed search over a [`LogSource`].
pub struct PollAdapter {
    source: Arc<dyn LogSource>,
    normalizer: Arc<dyn Normalizer>,
    config: PollConfig,
}

struct Progress {
    next_height: u64,
    scanned: usize,
}

enum Round {
    Done(Result<Option<LocatedEvent>, ProbeError>),
    Deadline,
    Cancelled,
}

impl PollAdapter {
    pub fn new(
        source: Arc<dyn LogSource>,
        normalizer: Arc<dyn Normalizer>,
        config: PollConfig,
    ) -> Self {
        Self {
            source,
            normalizer,
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.source.endpoint()
    }

    /// Current chain height from the source's height oracle.
    pub async fn current_height(&self) -> Result<u64, ProbeError> {
        self.source.current_height().await
    }

    /// Find the first event at or after `start_height` matching `filter`.
    ///
    /// Events are examined in `(height, tx_index, log_index)` order, so the
    /// earliest match wins.
    pub async fn locate(
        &self,
        start_height: u64,
        contract: &ContractFilter,
        filter: &Filter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LocatedEvent, ProbeError> {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut progress = Progress {
            next_height: start_height,
            scanned: 0,
        };
        let mut interval = Backoff::new(self.config.interval.clone());
        let mut retry = Backoff::new(self.config.retry.backoff.clone());
        let mut failures = 0u32;

        loop {
            let round = tokio::select! {
                biased;
                _ = cancel.cancelled() => Round::Cancelled,
                _ = time::sleep_until(deadline) => Round::Deadline,
                r = self.scan(&mut progress, contract, filter) => Round::Done(r),
            };

            let delay = match round {
                Round::Cancelled => return Err(ProbeError::Cancelled),
                Round::Deadline => return Err(self.not_found(started, &progress)),
                Round::Done(Ok(Some(found))) => {
                    tracing::debug!(
                        endpoint = %self.endpoint(),
                        height = found.location.height,
                        log_index = found.location.log_index,
                        scanned = progress.scanned,
                        "poll match found"
                    );
                    return Ok(found);
                }
                Round::Done(Ok(None)) => {
                    failures = 0;
                    retry.reset();
                    interval.next_delay()
                }
                Round::Done(Err(e)) if e.is_retryable() && failures < self.config.retry.max_retries => {
                    failures += 1;
                    let delay = retry.next_delay();
                    tracing::warn!(
                        endpoint = %self.endpoint(),
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "poll request failed, retrying"
                    );
                    delay
                }
                Round::Done(Err(e)) => return Err(e),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(self.not_found(started, &progress));
            }
            let delay = delay.min(deadline - now);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                _ = time::sleep(delay) => {}
            }
        }
    }

    fn not_found(&self, started: Instant, progress: &Progress) -> ProbeError {
        ProbeError::NotFound {
            waited_ms: started.elapsed().as_millis() as u64,
            scanned: progress.scanned,
            feed: FeedStatus::Polling,
        }
    }

    /// One round: scan every height between `next_height` and the head.
    async fn scan(
        &self,
        progress: &mut Progress,
        contract: &ContractFilter,
        filter: &Filter,
    ) -> Result<Option<LocatedEvent>, ProbeError> {
        let head = self.source.current_height().await?;
        let max_range = self.config.max_range.max(1);

        while progress.next_height <= head {
            let from = progress.next_height;
            let to = from.saturating_add(max_range - 1).min(head);

            let mut events = self.source.events_in_range(from, to, contract).await?;
            events.sort_by_key(|e| (e.location.height, e.location.tx_index, e.location.log_index));

            tracing::debug!(
                endpoint = %self.endpoint(),
                from,
                to,
                events = events.len(),
                "polled height range"
            );

            for event in events {
                let records = match self.normalizer.normalize_all(&event.raw) {
                    Ok(records) => records,
                    Err(e) => {
                        tracing::warn!(
                            endpoint = %self.endpoint(),
                            height = event.location.height,
                            error = %e,
                            "skipping malformed event"
                        );
                        continue;
                    }
                };
                for record in records {
                    let record = match record.location {
                        Some(_) => record,
                        None => record.with_location(event.location),
                    };
                    progress.scanned += 1;
                    if filter.matches(&record) {
                        return Ok(Some(LocatedEvent {
                            raw: event.raw,
                            location: record.location.unwrap_or(event.location),
                            record,
                        }));
                    }
                }
            }

            progress.next_height = to + 1;
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::AttributeNormalizer;
    use crate::source::{HeightOracle, RawEvent};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A chain whose head advances one block per height query.
    #[derive(Default)]
    struct FakeChain {
        head: AtomicU64,
        events: Mutex<Vec<RawEvent>>,
        ranges: Mutex<Vec<(u64, u64)>>,
        fail_next: AtomicU32,
    }

    impl FakeChain {
        fn emit(&self, height: u64, log_index: u32, status: &str) {
            self.events.lock().unwrap().push(RawEvent {
                raw: json!({"attributes": {"type": "packet", "status": status}}),
                location: EventLocation {
                    height,
                    tx_index: 0,
                    log_index,
                },
            });
        }
    }

    #[async_trait]
    impl HeightOracle for FakeChain {
        async fn current_height(&self) -> Result<u64, ProbeError> {
            Ok(self.head.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl LogSource for FakeChain {
        async fn events_in_range(
            &self,
            from: u64,
            to: u64,
            _filter: &ContractFilter,
        ) -> Result<Vec<RawEvent>, ProbeError> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(ProbeError::Http("502 bad gateway".into()));
            }
            self.ranges.lock().unwrap().push((from, to));
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| (from..=to).contains(&e.location.height))
                .cloned()
                .collect())
        }

        fn endpoint(&self) -> &str {
            "fake"
        }
    }

    fn adapter(chain: Arc<FakeChain>) -> PollAdapter {
        PollAdapter::new(
            chain,
            Arc::new(AttributeNormalizer),
            PollConfig {
                interval: BackoffConfig::fixed(Duration::from_millis(100)),
                max_range: 3,
                retry: RetryConfig {
                    max_retries: 2,
                    backoff: BackoffConfig::fixed(Duration::from_millis(10)),
                },
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_match_with_location() {
        let chain = Arc::new(FakeChain::default());
        chain.emit(4, 1, "0");
        chain.emit(4, 0, "1");
        chain.emit(5, 0, "0");

        let found = adapter(chain.clone())
            .locate(
                1,
                &ContractFilter::address("dapp"),
                &Filter::new().equals("status", "0"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            found.location,
            EventLocation {
                height: 4,
                tx_index: 0,
                log_index: 1
            }
        );
        assert_eq!(found.record.source_height, Some(4));
        assert_eq!(found.raw["attributes"]["status"], "0");
    }

    #[tokio::test(start_paused = true)]
    async fn ranges_are_chunked_and_never_rescanned() {
        let chain = Arc::new(FakeChain::default());
        chain.head.store(7, Ordering::SeqCst);

        let err = adapter(chain.clone())
            .locate(
                1,
                &ContractFilter::address("dapp"),
                &Filter::new().equals("status", "0"),
                Duration::from_millis(250),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let ranges = chain.ranges.lock().unwrap().clone();
        assert_eq!(&ranges[..3], &[(1, 3), (4, 6), (7, 8)]);
        for pair in ranges.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1, "range rescanned: {ranges:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_lands_within_one_interval_of_the_deadline() {
        let chain = Arc::new(FakeChain::default());
        chain.emit(1, 0, "1");
        let timeout = Duration::from_millis(250);

        let started = Instant::now();
        let err = adapter(chain)
            .locate(
                1,
                &ContractFilter::address("dapp"),
                &Filter::new().equals("status", "0"),
                timeout,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(
            matches!(err, ProbeError::NotFound { scanned: 1, feed: FeedStatus::Polling, .. }),
            "{err}"
        );
        assert!(elapsed >= timeout, "{elapsed:?}");
        // one poll interval of the test adapter
        assert!(elapsed <= timeout + Duration::from_millis(100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_still_finds_match() {
        let chain = Arc::new(FakeChain::default());
        chain.emit(1, 0, "0");

        let found = adapter(chain)
            .locate(
                1,
                &ContractFilter::address("dapp"),
                &Filter::new().equals("status", "0"),
                Duration::MAX,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(found.location.height, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let chain = Arc::new(FakeChain::default());
        chain.emit(1, 0, "0");
        chain.fail_next.store(2, Ordering::SeqCst);

        let found = adapter(chain.clone())
            .locate(
                1,
                &ContractFilter::address("dapp"),
                &Filter::new().equals("status", "0"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(found.location.height, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let chain = Arc::new(FakeChain::default());
        chain.fail_next.store(10, Ordering::SeqCst);

        let err = adapter(chain)
            .locate(
                1,
                &ContractFilter::address("dapp"),
                &Filter::new(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Http(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_search() {
        let chain = Arc::new(FakeChain::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = adapter(chain)
            .locate(
                1,
                &ContractFilter::address("dapp"),
                &Filter::new().equals("status", "0"),
                Duration::from_secs(60),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
