//! chainprobe-core: cross-chain event correlation for integration tests.
//!
//! # Overview
//!
//! A test subscribes to a contract on each chain it cares about, submits
//! its transactions, then asserts that the expected events show up on the
//! other side within a deadline. The core crate defines:
//!
//! - [`EventRecord`]: normalized attribute/value event
//! - [`Filter`]: conjunctive predicate, evaluated by [`filter::matches`]
//! - [`EventStore`]: append-only, single-writer/multi-reader buffer
//! - [`source`]: push and poll adapters plus the transport traits
//! - [`Correlator`]: bounded wait over a growing store
//! - [`Harness`] / [`Subscription`] / [`Scope`]: the API tests use
//! - [`ProbeError`]: structured error type
//!
//! ```no_run
//! # async fn demo(harness: chainprobe_core::Harness) -> Result<(), chainprobe_core::ProbeError> {
//! use std::time::Duration;
//! use chainprobe_core::{Filter, Scope};
//!
//! let scope = Scope::new();
//! scope
//!     .run(async {
//!         let sub = scope.subscribe(&harness, "wasm", "dapp").await?;
//!         let event = sub
//!             .await_event(
//!                 &Filter::new().equals("type", "packet").equals("status", "0"),
//!                 Duration::from_secs(5),
//!             )
//!             .await?;
//!         println!("settled at height {:?}", event.source_height);
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

pub mod correlator;
pub mod error;
pub mod filter;
pub mod harness;
pub mod lifecycle;
pub mod normalize;
pub mod policy;
pub mod record;
pub mod rpc;
pub mod source;
pub mod store;
pub mod subscription;
pub mod telemetry;

pub use correlator::{CorrelationState, Correlator, CorrelatorConfig};
pub use error::ProbeError;
pub use filter::{Expectation, Filter};
pub use harness::{ChainSource, Harness, HarnessConfig};
pub use lifecycle::{CloseReport, Scope};
pub use normalize::{AttributeNormalizer, EvmLogNormalizer, Normalizer};
pub use policy::{Backoff, BackoffConfig, RetryConfig};
pub use record::{EventLocation, EventRecord};
pub use source::{
    ContractFilter, EventFeed, FeedConnector, FeedStatus, HeightOracle, LogSource, RawEvent,
    SubscriptionQuery,
};
pub use store::{Cursor, EventStore, Snapshot};
pub use subscription::{SourceAdapter, Subscription};

pub use tokio_util::sync::CancellationToken;
