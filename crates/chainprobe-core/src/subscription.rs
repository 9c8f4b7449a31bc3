//! A test's handle on one chain/contract: source adapter plus lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::correlator::Correlator;
use crate::error::ProbeError;
use crate::filter::Filter;
use crate::record::EventRecord;
use crate::source::{ContractFilter, FeedStatus, PollAdapter, PushAdapter};
use crate::store::EventStore;

/// The two ways a subscription can observe a chain, chosen when it is created.
pub enum SourceAdapter {
    /// Background feed filling an event store.
    Push(PushAdapter),
    /// Height-indexed search starting from the height seen at subscribe time.
    Poll {
        adapter: PollAdapter,
        contract: ContractFilter,
        start_height: u64,
    },
}

impl SourceAdapter {
    fn status(&self) -> FeedStatus {
        match self {
            Self::Push(push) => push.status(),
            Self::Poll { .. } => FeedStatus::Polling,
        }
    }

    async fn find(
        &self,
        correlator: &Correlator,
        filter: &Filter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventRecord, ProbeError> {
        match self {
            Self::Push(push) => correlator
                .wait(push.store(), filter, timeout, || push.status(), cancel)
                .await
                .map(|record| (*record).clone()),
            Self::Poll {
                adapter,
                contract,
                start_height,
            } => adapter
                .locate(*start_height, contract, filter, timeout, cancel)
                .await
                .map(|located| located.record),
        }
    }

    async fn release(&self) -> Result<(), ProbeError> {
        match self {
            Self::Push(push) => push.stop().await,
            Self::Poll { .. } => Ok(()),
        }
    }

    fn release_now(&self) {
        if let Self::Push(push) = self {
            push.release_now();
        }
    }
}

/// Observes one contract on one chain for the duration of a test.
///
/// Exclusively owned by the test that created it. [`Subscription::close`]
/// releases the source exactly once; dropping an unclosed subscription
/// releases it synchronously.
pub struct Subscription {
    chain: String,
    contract: String,
    source: SourceAdapter,
    correlator: Correlator,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Subscription {
    pub fn new(
        chain: impl Into<String>,
        contract: impl Into<String>,
        source: SourceAdapter,
        correlator: Correlator,
    ) -> Self {
        Self {
            chain: chain.into(),
            contract: contract.into(),
            source,
            correlator,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn status(&self) -> FeedStatus {
        if self.is_closed() {
            return FeedStatus::Stopped;
        }
        self.source.status()
    }

    /// The push store, if this subscription is push-based.
    pub fn store(&self) -> Option<&EventStore> {
        match &self.source {
            SourceAdapter::Push(push) => Some(push.store()),
            SourceAdapter::Poll { .. } => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for the first event matching `filter`.
    pub async fn await_event(
        &self,
        filter: &Filter,
        timeout: Duration,
    ) -> Result<EventRecord, ProbeError> {
        if self.is_closed() {
            return Err(ProbeError::Closed);
        }
        tracing::debug!(
            chain = %self.chain,
            contract = %self.contract,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "awaiting event"
        );
        let result = self
            .source
            .find(&self.correlator, filter, timeout, &self.cancel)
            .await;
        // close() cancels in-flight waits through the same token
        match result {
            Err(ProbeError::Cancelled) if self.is_closed() => Err(ProbeError::Closed),
            other => other,
        }
    }

    /// Like [`Subscription::await_event`], also aborting when `cancel` fires.
    pub async fn await_event_until_cancelled(
        &self,
        filter: &Filter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventRecord, ProbeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            result = self.await_event(filter, timeout) => result,
        }
    }

    /// Stop background work. Safe to call any number of times; only the
    /// first call releases anything.
    pub async fn close(&self) -> Result<(), ProbeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        tracing::debug!(chain = %self.chain, contract = %self.contract, "closing subscription");
        self.source.release().await
    }

    /// Synchronous release used on drop paths.
    pub(crate) fn release_now(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            self.source.release_now();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("chain", &self.chain)
            .field("contract", &self.contract)
            .field("status", &self.status())
            .finish()
    }
}
