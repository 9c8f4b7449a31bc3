//! Binding subscriptions to the scope of one test.
//!
//! A [`Scope`] registers every subscription opened through it and releases
//! each one exactly once: on [`Scope::close`], at the end of
//! [`Scope::run`] (also when the body errors or panics), or synchronously
//! when the scope is dropped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;

use crate::error::ProbeError;
use crate::harness::Harness;
use crate::subscription::Subscription;

/// Outcome of closing a scope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CloseReport {
    /// Subscriptions stopped cleanly.
    pub closed: usize,
    /// `chain/contract` of subscriptions whose task had to be aborted.
    pub leaked: Vec<String>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }
}

/// Owner of every subscription a test opens.
#[derive(Default)]
pub struct Scope {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    fn registered(&self) -> MutexGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe through `harness` and register the result for release.
    pub async fn subscribe(
        &self,
        harness: &Harness,
        chain: &str,
        contract: &str,
    ) -> Result<Arc<Subscription>, ProbeError> {
        let subscription = harness.subscribe(chain, contract).await?;
        Ok(self.track(subscription))
    }

    /// Register an already created subscription.
    pub fn track(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        self.registered().push(subscription.clone());
        subscription
    }

    pub fn len(&self) -> usize {
        self.registered().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered subscription, in reverse creation order.
    ///
    /// Shutdown timeouts are logged and listed in the report; they never
    /// abort the remaining closes.
    pub async fn close(&self) -> CloseReport {
        let drained: Vec<_> = std::mem::take(&mut *self.registered());
        let mut report = CloseReport::default();

        for subscription in drained.into_iter().rev() {
            match subscription.close().await {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    let name = format!("{}/{}", subscription.chain(), subscription.contract());
                    tracing::warn!(subscription = %name, error = %e, "subscription leaked on close");
                    report.leaked.push(name);
                }
            }
        }

        report
    }

    /// Run `body`, then close the scope whatever the outcome.
    ///
    /// A panic inside `body` is re-raised after every subscription has been
    /// released.
    pub async fn run<F, T>(&self, body: F) -> T
    where
        F: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        let report = self.close().await;
        if !report.is_clean() {
            tracing::warn!(leaked = ?report.leaked, "scope closed with leaked tasks");
        }
        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        for subscription in self.registered().drain(..) {
            subscription.release_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ChainSource;
    use crate::normalize::AttributeNormalizer;
    use crate::source::{ChannelConnector, FeedStatus};

    fn harness(connector: &ChannelConnector) -> Harness {
        Harness::default().with_chain(
            "wasm",
            ChainSource::push(connector.clone(), AttributeNormalizer),
        )
    }

    #[tokio::test]
    async fn close_releases_each_subscription_once() {
        let connector = ChannelConnector::new("wasm");
        let harness = harness(&connector);
        let scope = Scope::new();

        let a = scope.subscribe(&harness, "wasm", "a").await.unwrap();
        let b = scope.subscribe(&harness, "wasm", "b").await.unwrap();
        assert_eq!(scope.len(), 2);

        let report = scope.close().await;
        assert_eq!(report.closed, 2);
        assert!(report.is_clean());
        assert_eq!(a.status(), FeedStatus::Stopped);
        assert_eq!(b.status(), FeedStatus::Stopped);

        // nothing left to release
        assert_eq!(scope.close().await, CloseReport::default());
    }

    #[tokio::test]
    async fn run_closes_after_error() {
        let connector = ChannelConnector::new("wasm");
        let harness = harness(&connector);
        let scope = Scope::new();

        let result: Result<(), ProbeError> = scope
            .run(async {
                scope.subscribe(&harness, "wasm", "dapp").await?;
                harness.subscribe("missing", "dapp").await?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ProbeError::UnknownChain { .. })));
        assert!(scope.is_empty());
        assert_eq!(connector.open_feeds(), 0);
    }

    #[tokio::test]
    async fn run_closes_after_panic() {
        let connector = ChannelConnector::new("wasm");
        let harness = harness(&connector);
        let scope = Scope::new();

        let outcome = AssertUnwindSafe(scope.run(async {
            let sub = scope.subscribe(&harness, "wasm", "dapp").await.unwrap();
            assert_eq!(sub.status(), FeedStatus::Live);
            panic!("test body failed");
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert!(scope.is_empty());
        assert_eq!(connector.open_feeds(), 0);
    }

    #[tokio::test]
    async fn drop_releases_synchronously() {
        let connector = ChannelConnector::new("wasm");
        let harness = harness(&connector);
        let scope = Scope::new();
        let sub = scope.subscribe(&harness, "wasm", "dapp").await.unwrap();

        drop(scope);
        assert!(sub.is_closed());
        assert!(sub.store().unwrap().is_sealed());
    }
}
