//! Polling an in-process JSON-RPC node over HTTP.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use chainprobe_core::source::PollConfig;
use chainprobe_core::{
    BackoffConfig, ChainSource, ContractFilter, EvmLogNormalizer, FeedStatus, Filter, Harness,
    HeightOracle, LogSource, ProbeError,
};
use chainprobe_http::{HttpLogSource, HttpSourceConfig};

#[derive(Default)]
struct Chain {
    head: u64,
    logs: Vec<Value>,
    /// Answer every request with this HTTP status instead.
    fail_with: Option<u16>,
}

type Shared = Arc<Mutex<Chain>>;

fn hex(n: u64) -> String {
    format!("0x{n:x}")
}

fn height(value: &Value) -> u64 {
    u64::from_str_radix(value.as_str().unwrap().trim_start_matches("0x"), 16).unwrap()
}

fn answer(chain: &Shared, request: &Value) -> Value {
    let mut chain = chain.lock().unwrap();
    let result = match request["method"].as_str().unwrap() {
        "eth_blockNumber" => {
            // every query mines a block
            let head = chain.head;
            chain.head += 1;
            json!(hex(head))
        }
        "eth_getLogs" => {
            let filter = &request["params"][0];
            let (from, to) = (height(&filter["fromBlock"]), height(&filter["toBlock"]));
            let logs: Vec<_> = chain
                .logs
                .iter()
                .filter(|log| (from..=to).contains(&height(&log["blockNumber"])))
                .filter(|log| log["address"] == filter["address"])
                .cloned()
                .collect();
            json!(logs)
        }
        other => panic!("unexpected method {other}"),
    };
    json!({ "jsonrpc": "2.0", "id": request["id"], "result": result })
}

/// JSON-RPC over `POST /`, or the configured failure status.
async fn rpc(State(chain): State<Shared>, Json(request): Json<Value>) -> Response {
    let fail_with = chain.lock().unwrap().fail_with;
    match fail_with {
        Some(code) => (StatusCode::from_u16(code).unwrap(), "upstream unavailable").into_response(),
        None => Json(answer(&chain, &request)).into_response(),
    }
}

async fn node(chain: Shared) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new().route("/", post(rpc)).with_state(chain);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    url
}

fn log(block: u64, address: &str, topic: &str) -> Value {
    json!({
        "address": address,
        "topics": [topic],
        "data": "0x",
        "blockNumber": hex(block),
        "transactionHash": "0xfeed",
        "transactionIndex": "0x0",
        "logIndex": "0x0",
        "removed": false
    })
}

#[tokio::test]
async fn height_and_logs_round_trip() {
    let chain = Shared::default();
    {
        let mut c = chain.lock().unwrap();
        c.head = 0x20;
        c.logs = vec![log(0x21, "0xdapp", "0xa"), log(0x21, "0xother", "0xa"), log(0x40, "0xdapp", "0xb")];
    }
    let url = node(chain.clone()).await;
    let source = HttpLogSource::new(url, HttpSourceConfig::default()).unwrap();

    assert_eq!(source.current_height().await.unwrap(), 0x20);

    let events = source
        .events_in_range(0x20, 0x30, &ContractFilter::address("0xdapp"))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].location.height, 0x21);
}

#[tokio::test]
async fn server_errors_are_retryable_http_failures() {
    let chain = Shared::default();
    chain.lock().unwrap().fail_with = Some(503);
    let url = node(chain).await;
    let source = HttpLogSource::new(url, HttpSourceConfig::default()).unwrap();

    let err = source.current_height().await.unwrap_err();
    assert!(matches!(&err, ProbeError::Http(msg) if msg.contains("503")), "{err}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn poll_subscription_finds_log_mined_after_subscribe() {
    chainprobe_core::telemetry::init_tracing();
    let chain = Shared::default();
    chain.lock().unwrap().head = 100;
    let url = node(chain.clone()).await;

    let source = HttpLogSource::new(url, HttpSourceConfig::default()).unwrap();
    let harness = Harness::default().with_chain(
        "evm",
        ChainSource::Poll {
            source: Arc::new(source),
            normalizer: Arc::new(EvmLogNormalizer),
            config: PollConfig {
                interval: BackoffConfig::fixed(Duration::from_millis(20)),
                ..PollConfig::default()
            },
        },
    );

    let sub = harness.subscribe("evm", "0xdapp").await.unwrap();
    assert_eq!(sub.status(), FeedStatus::Polling);

    // mined before the subscription: ignored
    chain.lock().unwrap().logs.push(log(90, "0xdapp", "0xcall"));
    chain.lock().unwrap().logs.push(log(102, "0xdapp", "0xcall"));

    let event = sub
        .await_event(&Filter::new().equals("event", "0xcall"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(event.location.unwrap().height, 102);
    sub.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_node_fails_poll_subscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let source = HttpLogSource::new(url, HttpSourceConfig::default()).unwrap();
    let harness = Harness::default().with_chain("evm", ChainSource::poll(source, EvmLogNormalizer));

    let err = harness.subscribe("evm", "0xdapp").await.unwrap_err();
    assert!(matches!(err, ProbeError::Connection { .. }), "{err}");
}
