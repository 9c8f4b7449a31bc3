//! Normalizer for Tendermint/CometBFT subscription results.

use serde_json::Value;

use chainprobe_core::normalize::{parse_height, Normalizer};
use chainprobe_core::{EventLocation, EventRecord, ProbeError};

/// Builds one record per typed event of a Tendermint transaction result:
///
/// ```text
/// { "query": "...",
///   "data": { "type": "tendermint/event/Tx", "value": { "TxResult": {
///       "height": "12", "index": 0,
///       "result": { "events": [
///           { "type": "wasm", "attributes": [ { "key": "status", "value": "0" } ] } ] } } } },
///   "events": { "wasm.status": ["0"], "tx.height": ["12"], "tx.hash": ["AB.."] } }
/// ```
///
/// Each record carries the bare attribute keys plus `type`, so a filter never
/// matches values that came from two different events. The flattened
/// `events` map is only read for `tx.height` and `tx.hash`.
#[derive(Debug, Clone, Default)]
pub struct TendermintNormalizer {
    event_type: Option<String>,
}

impl TendermintNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only events whose `type` equals `event_type`, e.g. `"wasm"`.
    pub fn for_event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
        }
    }

    fn wanted(&self, event: &Value) -> bool {
        match &self.event_type {
            Some(wanted) => event.get("type").and_then(Value::as_str) == Some(wanted.as_str()),
            None => true,
        }
    }
}

fn flattened<'a>(raw: &'a Value, key: &str) -> Option<&'a Value> {
    raw.get("events").and_then(|events| events.get(key)).and_then(|v| v.get(0))
}

impl Normalizer for TendermintNormalizer {
    /// One typed event: `{ "type": "wasm", "attributes": [ { "key", "value" } ] }`.
    fn normalize(&self, raw: &Value) -> Result<EventRecord, ProbeError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProbeError::normalization("event has no type"))?;
        let attributes = raw
            .get("attributes")
            .and_then(Value::as_array)
            .ok_or_else(|| ProbeError::normalization("event has no attribute list"))?;

        let mut record = EventRecord::new().with_attribute("type", kind);
        for pair in attributes {
            let key = pair
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| ProbeError::normalization("attribute without a key"))?;
            let value = match pair.get("value") {
                Some(Value::String(s)) => s.as_str(),
                None | Some(Value::Null) => "",
                Some(_) => {
                    return Err(ProbeError::normalization(format!("non-string value under {key}")))
                }
            };
            record.push_attribute(key, value);
        }
        Ok(record)
    }

    /// Every typed event of a `tendermint/event/Tx` result, in emission order.
    fn normalize_all(&self, raw: &Value) -> Result<Vec<EventRecord>, ProbeError> {
        let tx = raw
            .pointer("/data/value/TxResult")
            .ok_or_else(|| ProbeError::normalization("result has no TxResult"))?;
        let events = tx
            .pointer("/result/events")
            .and_then(Value::as_array)
            .ok_or_else(|| ProbeError::normalization("TxResult has no event list"))?;

        let height = match tx.get("height").or_else(|| flattened(raw, "tx.height")) {
            Some(height) => Some(parse_height(height)?),
            None => None,
        };
        let tx_index = match tx.get("index") {
            Some(index) => u32::try_from(parse_height(index)?)
                .map_err(|_| ProbeError::normalization("transaction index out of range"))?,
            None => 0,
        };
        let hash = flattened(raw, "tx.hash").and_then(Value::as_str);

        let mut records = Vec::with_capacity(events.len());
        for (position, event) in events.iter().enumerate() {
            if !self.wanted(event) {
                continue;
            }
            let mut record = self.normalize(event)?;
            if let Some(hash) = hash {
                record.push_attribute("tx.hash", hash);
            }
            if let Some(height) = height {
                let log_index = u32::try_from(position)
                    .map_err(|_| ProbeError::normalization("too many events in one transaction"))?;
                record = record.with_location(EventLocation {
                    height,
                    tx_index,
                    log_index,
                });
            }
            records.push(record);
        }
        Ok(records)
    }
}
