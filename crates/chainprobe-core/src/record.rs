//! The normalized event record every source produces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where a polled event lives on chain, enough to fetch the full transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLocation {
    pub height: u64,
    pub tx_index: u32,
    pub log_index: u32,
}

/// One on-chain event as keyed attribute/value pairs.
///
/// A key may carry several values because chain event formats allow repeated
/// attributes (e.g. several addresses under one key). Values keep the order in
/// which the source delivered them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub attributes: BTreeMap<String, Vec<String>>,
    pub source_height: Option<u64>,
    pub sequence: Option<u64>,
    pub location: Option<EventLocation>,
}

impl EventRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` under `key`, keeping any values already present.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_attribute(key, value);
        self
    }

    pub fn with_height(mut self, height: u64) -> Self {
        self.source_height = Some(height);
        self
    }

    pub fn with_location(mut self, location: EventLocation) -> Self {
        self.source_height = Some(location.height);
        self.location = Some(location);
        self
    }

    pub fn push_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .entry(key.into())
            .or_default()
            .push(value.into());
    }

    /// All values stored under `key`, empty if absent.
    pub fn values(&self, key: &str) -> &[String] {
        self.attributes.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value stored under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.values(key).first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_keys_keep_delivery_order() {
        let record = EventRecord::new()
            .with_attribute("receiver", "osmo1a")
            .with_attribute("receiver", "osmo1b")
            .with_attribute("type", "packet");
        assert_eq!(record.values("receiver"), ["osmo1a", "osmo1b"]);
        assert_eq!(record.first("type"), Some("packet"));
        assert!(record.values("missing").is_empty());
    }

    #[test]
    fn location_sets_height() {
        let record = EventRecord::new().with_location(EventLocation {
            height: 42,
            tx_index: 1,
            log_index: 3,
        });
        assert_eq!(record.source_height, Some(42));
        assert_eq!(record.location.unwrap().log_index, 3);
    }

    #[test]
    fn height_without_location() {
        let record = EventRecord::new().with_attribute("type", "packet").with_height(7);
        assert_eq!(record.source_height, Some(7));
        assert!(record.location.is_none());
    }
}
