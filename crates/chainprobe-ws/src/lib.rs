//! chainprobe-ws: WebSocket push feeds for chainprobe subscriptions.
//!
//! [`WsFeedConnector`] implements [`chainprobe_core::FeedConnector`] over a
//! JSON-RPC WebSocket endpoint. Two subscription dialects are supported:
//! Tendermint/CometBFT `subscribe` queries and Ethereum `eth_subscribe`
//! log subscriptions.
//!
//! # Example
//!
//! ```no_run
//! use chainprobe_core::{ChainSource, Harness};
//! use chainprobe_ws::{TendermintNormalizer, WsFeedConfig, WsFeedConnector};
//!
//! let connector = WsFeedConnector::new("ws://localhost:26657/websocket", WsFeedConfig::default());
//! let harness = Harness::default().with_chain(
//!     "wasm",
//!     ChainSource::push(connector, TendermintNormalizer::for_event_type("wasm")),
//! );
//! # let _ = harness;
//! ```

pub mod feed;
pub mod tendermint;

pub use feed::{WsDialect, WsFeed, WsFeedConfig, WsFeedConnector};
pub use tendermint::TendermintNormalizer;
