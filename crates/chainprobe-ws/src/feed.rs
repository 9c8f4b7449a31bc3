//! WebSocket JSON-RPC subscription feed.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chainprobe_core::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use chainprobe_core::source::{EventFeed, FeedConnector, SubscriptionQuery};
use chainprobe_core::ProbeError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIBE_ID: u64 = 1;
const UNSUBSCRIBE_ID: u64 = 2;

/// Subscription protocol spoken by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsDialect {
    /// Tendermint/CometBFT `subscribe` with an event query.
    ///
    /// `{contract}` in the template is replaced by the subscribed contract.
    Tendermint { query_template: String },
    /// `eth_subscribe("logs", { "address": contract })`.
    Ethereum,
}

impl Default for WsDialect {
    fn default() -> Self {
        Self::tendermint_wasm()
    }
}

impl WsDialect {
    /// Transactions touching a CosmWasm contract.
    pub fn tendermint_wasm() -> Self {
        Self::Tendermint {
            query_template: "tm.event='Tx' AND wasm._contract_address='{contract}'".into(),
        }
    }

    fn subscribe_request(&self, contract: &str) -> JsonRpcRequest {
        match self {
            Self::Tendermint { query_template } => JsonRpcRequest::new(
                SUBSCRIBE_ID,
                "subscribe",
                json!({ "query": query_template.replace("{contract}", contract) }),
            ),
            Self::Ethereum => JsonRpcRequest::new(
                SUBSCRIBE_ID,
                "eth_subscribe",
                json!(["logs", { "address": contract }]),
            ),
        }
    }

    fn unsubscribe_request(&self, contract: &str, subscription: Option<&str>) -> JsonRpcRequest {
        match self {
            Self::Tendermint { query_template } => JsonRpcRequest::new(
                UNSUBSCRIBE_ID,
                "unsubscribe",
                json!({ "query": query_template.replace("{contract}", contract) }),
            ),
            Self::Ethereum => {
                JsonRpcRequest::new(UNSUBSCRIBE_ID, "eth_unsubscribe", json!([subscription]))
            }
        }
    }

    /// The event payload carried by `frame`, if it is a notification for
    /// this subscription.
    fn notification(&self, frame: &Value, subscription: Option<&str>) -> Option<Value> {
        match self {
            // events arrive as further responses to the subscribe id
            Self::Tendermint { .. } => frame
                .get("result")
                .filter(|r| r.get("events").is_some() || r.get("data").is_some())
                .cloned(),
            Self::Ethereum => {
                if frame.get("method").and_then(Value::as_str) != Some("eth_subscription") {
                    return None;
                }
                let params = frame.get("params")?;
                let id = params.get("subscription").and_then(Value::as_str);
                if subscription.is_some() && id != subscription {
                    return None;
                }
                params.get("result").cloned()
            }
        }
    }
}

/// Configuration for [`WsFeedConnector`].
#[derive(Debug, Clone)]
pub struct WsFeedConfig {
    pub dialect: WsDialect,
    /// Limit on the TCP + WebSocket handshake.
    pub connect_timeout: Duration,
    /// Limit on waiting for the subscription acknowledgement.
    pub subscribe_timeout: Duration,
}

impl Default for WsFeedConfig {
    fn default() -> Self {
        Self {
            dialect: WsDialect::default(),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens one WebSocket connection per subscription.
#[derive(Debug, Clone)]
pub struct WsFeedConnector {
    url: String,
    config: WsFeedConfig,
}

impl WsFeedConnector {
    pub fn new(url: impl Into<String>, config: WsFeedConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    async fn handshake(&self, contract: &str) -> Result<(WsStream, Option<String>), ProbeError> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (mut stream, _) = time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| ProbeError::connection(&self.url, "connect timed out"))?
            .map_err(|e| ProbeError::connection(&self.url, e))?;

        let request = self.config.dialect.subscribe_request(contract);
        let text = serde_json::to_string(&request)?;
        stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ProbeError::connection(&self.url, e))?;

        let ack = await_response(&mut stream, SUBSCRIBE_ID);
        let ack = time::timeout(self.config.subscribe_timeout, ack)
            .await
            .map_err(|_| ProbeError::connection(&self.url, "no subscription acknowledgement"))?
            .map_err(|e| ProbeError::connection(&self.url, e))?;

        // Ethereum answers with the subscription id; Tendermint with `{}`
        let subscription = ack.as_str().map(str::to_string);
        Ok((stream, subscription))
    }
}

#[async_trait]
impl FeedConnector for WsFeedConnector {
    async fn connect(&self, query: &SubscriptionQuery) -> Result<Box<dyn EventFeed>, ProbeError> {
        tracing::info!(url = %self.url, contract = %query.contract, "connecting via WebSocket");
        let (stream, subscription) = self.handshake(&query.contract).await?;
        tracing::debug!(url = %self.url, subscription = ?subscription, "subscription acknowledged");

        let unsubscribe = self
            .config
            .dialect
            .unsubscribe_request(&query.contract, subscription.as_deref());
        Ok(Box::new(WsFeed {
            url: self.url.clone(),
            stream,
            dialect: self.config.dialect.clone(),
            subscription,
            unsubscribe,
            closed: false,
        }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Read frames until the response to `id` arrives.
async fn await_response(stream: &mut WsStream, id: u64) -> Result<Value, ProbeError> {
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| ProbeError::WebSocket(e.to_string()))?;
        match msg {
            Message::Text(text) => {
                let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(text.as_str()) else {
                    continue;
                };
                if resp.id.as_u64() == Some(id) {
                    return resp.into_result();
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ProbeError::WebSocket("closed before subscription ack".into()))
}

/// A live WebSocket subscription.
pub struct WsFeed {
    url: String,
    stream: WsStream,
    dialect: WsDialect,
    subscription: Option<String>,
    unsubscribe: JsonRpcRequest,
    closed: bool,
}

impl std::fmt::Debug for WsFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsFeed")
            .field("url", &self.url)
            .field("subscription", &self.subscription)
            .field("closed", &self.closed)
            .finish()
    }
}

impl WsFeed {
    fn on_text(&self, text: &str) -> Option<Result<Value, ProbeError>> {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return Some(Err(ProbeError::normalization(format!("malformed frame: {e}")))),
        };

        if let Some(error) = frame.get("error") {
            let err = serde_json::from_value::<JsonRpcError>(error.clone())
                .map(ProbeError::from)
                .unwrap_or_else(|_| ProbeError::WebSocket(error.to_string()));
            return Some(Err(err));
        }

        self.dialect
            .notification(&frame, self.subscription.as_deref())
            .map(Ok)
    }
}

#[async_trait]
impl EventFeed for WsFeed {
    async fn next_event(&mut self) -> Option<Result<Value, ProbeError>> {
        if self.closed {
            return None;
        }
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ProbeError::WebSocket(e.to_string()))),
            };
            match msg {
                Message::Text(text) => {
                    if let Some(event) = self.on_text(text.as_str()) {
                        return Some(event);
                    }
                }
                Message::Close(frame) => {
                    tracing::debug!(url = %self.url, ?frame, "server closed the feed");
                    return None;
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Ok(text) = serde_json::to_string(&self.unsubscribe) {
            if let Err(e) = self.stream.send(Message::Text(text.into())).await {
                tracing::debug!(url = %self.url, error = %e, "unsubscribe failed");
            }
        }
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(url = %self.url, error = %e, "WebSocket close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tendermint_query_names_the_contract() {
        let req = WsDialect::tendermint_wasm().subscribe_request("wasm1dapp");
        assert_eq!(req.method, "subscribe");
        assert_eq!(
            req.params["query"],
            "tm.event='Tx' AND wasm._contract_address='wasm1dapp'"
        );
    }

    #[test]
    fn tendermint_ack_is_not_an_event() {
        let dialect = WsDialect::tendermint_wasm();
        let ack = json!({ "jsonrpc": "2.0", "id": 1, "result": {} });
        assert!(dialect.notification(&ack, None).is_none());

        let event = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "query": "q", "events": { "wasm.status": ["0"] } }
        });
        let payload = dialect.notification(&event, None).unwrap();
        assert_eq!(payload["events"]["wasm.status"][0], "0");
    }

    #[test]
    fn ethereum_notifications_are_matched_by_subscription_id() {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "0xabc", "result": { "address": "0xdapp" } }
        });
        let dialect = WsDialect::Ethereum;
        assert!(dialect.notification(&frame, Some("0xabc")).is_some());
        assert!(dialect.notification(&frame, Some("0xother")).is_none());

        let unsub = dialect.unsubscribe_request("0xdapp", Some("0xabc"));
        assert_eq!(unsub.method, "eth_unsubscribe");
        assert_eq!(unsub.params, json!(["0xabc"]));
    }
}
