//! Chain registry: maps chain names to sources and opens subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use crate::correlator::{Correlator, CorrelatorConfig};
use crate::error::ProbeError;
use crate::normalize::Normalizer;
use crate::source::{
    ContractFilter, FeedConnector, LogSource, PollAdapter, PollConfig, PushAdapter, PushConfig,
    SubscriptionQuery,
};
use crate::subscription::{SourceAdapter, Subscription};

/// How the harness reaches one chain.
#[derive(Clone)]
pub enum ChainSource {
    /// Chain with a push subscription endpoint.
    Push {
        connector: Arc<dyn FeedConnector>,
        normalizer: Arc<dyn Normalizer>,
        config: PushConfig,
    },
    /// Request/response-only chain.
    Poll {
        source: Arc<dyn LogSource>,
        normalizer: Arc<dyn Normalizer>,
        config: PollConfig,
    },
}

impl ChainSource {
    pub fn push(connector: impl FeedConnector, normalizer: impl Normalizer) -> Self {
        Self::Push {
            connector: Arc::new(connector),
            normalizer: Arc::new(normalizer),
            config: PushConfig::default(),
        }
    }

    pub fn poll(source: impl LogSource, normalizer: impl Normalizer) -> Self {
        Self::Poll {
            source: Arc::new(source),
            normalizer: Arc::new(normalizer),
            config: PollConfig::default(),
        }
    }

    fn endpoint(&self) -> &str {
        match self {
            Self::Push { connector, .. } => connector.endpoint(),
            Self::Poll { source, .. } => source.endpoint(),
        }
    }
}

/// Harness-wide settings.
#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    pub correlator: CorrelatorConfig,
}

/// Holds the sources for every chain a test run talks to.
///
/// Tests receive the harness explicitly; it keeps no global state.
#[derive(Clone, Default)]
pub struct Harness {
    chains: HashMap<String, ChainSource>,
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            chains: HashMap::new(),
            config,
        }
    }

    /// Register (or replace) the source for `chain`.
    pub fn register(&mut self, chain: impl Into<String>, source: ChainSource) -> &mut Self {
        self.chains.insert(chain.into(), source);
        self
    }

    pub fn with_chain(mut self, chain: impl Into<String>, source: ChainSource) -> Self {
        self.register(chain, source);
        self
    }

    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    /// Start observing `contract` on `chain`.
    ///
    /// Push chains connect and start their feed task now; poll chains record
    /// the current height as the lower bound of every later search.
    pub async fn subscribe(&self, chain: &str, contract: &str) -> Result<Subscription, ProbeError> {
        let source = self
            .chains
            .get(chain)
            .ok_or_else(|| ProbeError::UnknownChain {
                chain: chain.to_string(),
            })?;

        let adapter = match source {
            ChainSource::Push {
                connector,
                normalizer,
                config,
            } => {
                let query = SubscriptionQuery::new(chain, contract);
                SourceAdapter::Push(
                    PushAdapter::start(connector.as_ref(), normalizer.clone(), &query, config.clone())
                        .await?,
                )
            }
            ChainSource::Poll {
                source,
                normalizer,
                config,
            } => {
                let adapter = PollAdapter::new(source.clone(), normalizer.clone(), config.clone());
                let start_height = adapter
                    .current_height()
                    .await
                    .map_err(|e| match e {
                        e @ ProbeError::Connection { .. } => e,
                        other => ProbeError::connection(source.endpoint(), other),
                    })?;
                tracing::info!(
                    endpoint = %source.endpoint(),
                    chain,
                    contract,
                    start_height,
                    "poll subscription started"
                );
                SourceAdapter::Poll {
                    adapter,
                    contract: ContractFilter::address(contract),
                    start_height,
                }
            }
        };

        tracing::debug!(chain, contract, endpoint = %source.endpoint(), "subscribed");
        Ok(Subscription::new(
            chain,
            contract,
            adapter,
            Correlator::new(self.config.correlator.clone()),
        ))
    }
}
