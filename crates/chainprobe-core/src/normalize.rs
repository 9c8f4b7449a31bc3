//! Turning raw chain payloads into [`EventRecord`]s.

use serde_json::Value;

use crate::error::ProbeError;
use crate::record::{EventLocation, EventRecord};

/// Converts raw payloads into records, one record per on-chain event.
///
/// Implementations must be pure; a failure only skips that payload.
pub trait Normalizer: Send + Sync + 'static {
    /// Normalize a payload carrying exactly one event.
    fn normalize(&self, raw: &Value) -> Result<EventRecord, ProbeError>;

    /// Normalize a payload that may carry several events, such as a whole
    /// transaction, into one record per event in emission order.
    ///
    /// Adapters call this; the default treats the payload as one event.
    fn normalize_all(&self, raw: &Value) -> Result<Vec<EventRecord>, ProbeError> {
        self.normalize(raw).map(|record| vec![record])
    }
}

impl<F> Normalizer for F
where
    F: Fn(&Value) -> Result<EventRecord, ProbeError> + Send + Sync + 'static,
{
    fn normalize(&self, raw: &Value) -> Result<EventRecord, ProbeError> {
        self(raw)
    }
}

/// Normalizer for plain JSON events.
///
/// Accepts either of
///
/// ```text
/// { "attributes": { "type": "packet", "receiver": ["a", "b"] }, "height": 12 }
/// { "type": "packet", "attributes": [ { "key": "status", "value": "1" } ], "height": "12" }
/// ```
///
/// Scalars are stringified. A top-level `type` becomes the `type` attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeNormalizer;

impl Normalizer for AttributeNormalizer {
    fn normalize(&self, raw: &Value) -> Result<EventRecord, ProbeError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| ProbeError::normalization("event is not a JSON object"))?;

        let mut record = EventRecord::new();

        if let Some(kind) = obj.get("type") {
            record.push_attribute("type", scalar(kind)?);
        }

        match obj.get("attributes") {
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    match value {
                        Value::Array(items) => {
                            for item in items {
                                record.push_attribute(key.as_str(), scalar(item)?);
                            }
                        }
                        other => record.push_attribute(key.as_str(), scalar(other)?),
                    }
                }
            }
            Some(Value::Array(pairs)) => {
                for pair in pairs {
                    let key = pair
                        .get("key")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ProbeError::normalization("attribute without a key"))?;
                    let value = pair.get("value").unwrap_or(&Value::Null);
                    record.push_attribute(key, scalar(value)?);
                }
            }
            Some(_) => return Err(ProbeError::normalization("attributes must be a map or a list")),
            None => return Err(ProbeError::normalization("event has no attributes")),
        }

        if let Some(height) = obj.get("height") {
            record.source_height = Some(parse_height(height)?);
        }

        Ok(record)
    }
}

fn scalar(value: &Value) -> Result<String, ProbeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(ProbeError::normalization("attribute value is not a scalar")),
    }
}

/// Parse a height given as a number, a decimal string or a `0x` hex string.
pub fn parse_height(value: &Value) -> Result<u64, ProbeError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    };
    parsed.ok_or_else(|| ProbeError::normalization(format!("invalid height: {value}")))
}

/// Normalizer for EVM logs as returned by `eth_getLogs` or a `logs`
/// subscription.
///
/// Produces `address` (lowercase), `topics` in order (so `Filter::at`
/// addresses indexed arguments), `event` (topic 0), `data` and
/// `transaction_hash`. Logs flagged `removed` by a reorg are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmLogNormalizer;

impl Normalizer for EvmLogNormalizer {
    fn normalize(&self, raw: &Value) -> Result<EventRecord, ProbeError> {
        if raw.get("removed").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ProbeError::normalization("log removed by reorg"));
        }

        let address = raw
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| ProbeError::normalization("log has no address"))?;
        let topics = raw
            .get("topics")
            .and_then(Value::as_array)
            .ok_or_else(|| ProbeError::normalization("log has no topics"))?;

        let mut record = EventRecord::new().with_attribute("address", address.to_lowercase());
        for (i, topic) in topics.iter().enumerate() {
            let topic = topic
                .as_str()
                .ok_or_else(|| ProbeError::normalization("topic is not a string"))?;
            if i == 0 {
                record.push_attribute("event", topic);
            }
            record.push_attribute("topics", topic);
        }
        if let Some(data) = raw.get("data").and_then(Value::as_str) {
            record.push_attribute("data", data);
        }
        if let Some(tx) = raw.get("transactionHash").and_then(Value::as_str) {
            record.push_attribute("transaction_hash", tx);
        }

        match evm_log_location(raw) {
            Ok(location) => Ok(record.with_location(location)),
            // pending logs carry no block number yet
            Err(_) => Ok(record),
        }
    }
}

/// `(blockNumber, transactionIndex, logIndex)` of an EVM log.
pub fn evm_log_location(raw: &Value) -> Result<EventLocation, ProbeError> {
    let field = |name: &str| {
        raw.get(name)
            .ok_or_else(|| ProbeError::normalization(format!("log has no {name}")))
            .and_then(parse_height)
    };
    let index = |name: &str| {
        let value = field(name)?;
        u32::try_from(value)
            .map_err(|_| ProbeError::normalization(format!("{name} out of range: {value}")))
    };
    Ok(EventLocation {
        height: field("blockNumber")?,
        tx_index: index("transactionIndex")?,
        log_index: index("logIndex")?,
    })
}
