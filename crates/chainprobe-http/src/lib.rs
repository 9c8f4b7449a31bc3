//! chainprobe-http: HTTP JSON-RPC poll source for chainprobe subscriptions.
//!
//! [`HttpLogSource`] implements [`chainprobe_core::LogSource`] over an
//! Ethereum-style endpoint (`eth_blockNumber` / `eth_getLogs`), for chains
//! that offer no push subscription.
//!
//! ```no_run
//! use chainprobe_core::{ChainSource, EvmLogNormalizer, Harness};
//! use chainprobe_http::{HttpLogSource, HttpSourceConfig};
//!
//! # fn demo() -> Result<(), chainprobe_core::ProbeError> {
//! let source = HttpLogSource::new("http://localhost:8545", HttpSourceConfig::default())?;
//! let harness = Harness::default().with_chain("evm", ChainSource::poll(source, EvmLogNormalizer));
//! # let _ = harness;
//! # Ok(())
//! # }
//! ```

pub mod source;

pub use source::{HttpLogSource, HttpSourceConfig};
