//! `eth_getLogs` poll source backed by `reqwest`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainprobe_core::normalize::{evm_log_location, parse_height};
use chainprobe_core::rpc::{JsonRpcRequest, JsonRpcResponse};
use chainprobe_core::source::{ContractFilter, HeightOracle, LogSource, RawEvent};
use chainprobe_core::ProbeError;

/// Configuration for [`HttpLogSource`].
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub request_timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// JSON-RPC log source for one HTTP endpoint.
///
/// Each call is a single attempt; retry is left to the poll adapter's
/// budget.
pub struct HttpLogSource {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpLogSource {
    pub fn new(url: impl Into<String>, config: HttpSourceConfig) -> Result<Self, ProbeError> {
        let url = url.into();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProbeError::connection(&url, e))?;
        Ok(Self {
            url,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ProbeError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProbeError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?
            .into_result()
    }
}

impl std::fmt::Debug for HttpLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLogSource").field("url", &self.url).finish()
    }
}

#[async_trait]
impl HeightOracle for HttpLogSource {
    async fn current_height(&self) -> Result<u64, ProbeError> {
        let head = self.call("eth_blockNumber", json!([])).await?;
        parse_height(&head)
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn events_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &ContractFilter,
    ) -> Result<Vec<RawEvent>, ProbeError> {
        let logs = self.call("eth_getLogs", json!([log_filter(from, to, filter)])).await?;
        let Value::Array(logs) = logs else {
            return Err(ProbeError::Rpc {
                code: -32000,
                message: "eth_getLogs did not return an array".into(),
            });
        };

        let mut events = Vec::with_capacity(logs.len());
        for raw in logs {
            if raw.get("removed").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            match evm_log_location(&raw) {
                Ok(location) => events.push(RawEvent { raw, location }),
                Err(e) => tracing::warn!(url = %self.url, error = %e, "log without location skipped"),
            }
        }
        tracing::debug!(url = %self.url, from, to, count = events.len(), "logs fetched");
        Ok(events)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// The `eth_getLogs` filter object for `[from, to]`.
fn log_filter(from: u64, to: u64, filter: &ContractFilter) -> Value {
    let mut obj = json!({
        "fromBlock": format!("0x{from:x}"),
        "toBlock": format!("0x{to:x}"),
        "address": filter.address,
    });
    if !filter.topics.is_empty() {
        obj["topics"] = json!(filter.topics);
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_uses_hex_heights() {
        let filter = ContractFilter::address("0xdapp").with_topic("0xsig");
        let obj = log_filter(16, 255, &filter);
        assert_eq!(obj["fromBlock"], "0x10");
        assert_eq!(obj["toBlock"], "0xff");
        assert_eq!(obj["address"], "0xdapp");
        assert_eq!(obj["topics"], json!(["0xsig"]));
    }

    #[test]
    fn topics_omitted_when_unconstrained() {
        let obj = log_filter(1, 2, &ContractFilter::address("0xdapp"));
        assert!(obj.get("topics").is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_http_error() {
        let source = HttpLogSource::new("http://127.0.0.1:1", HttpSourceConfig::default()).unwrap();
        let err = source.current_height().await.unwrap_err();
        assert!(matches!(err, ProbeError::Http(_)), "{err}");
        assert!(err.is_retryable());
    }
}
