//! Helpers for spinning up a whole proxy against mock upstreams.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use hashbrown::HashMap;
use hyper::body::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use web3_gateway::app::Web3GatewayApp;
use web3_gateway::config::TopConfig;
use web3_gateway::frontend;

/// A fake execution node. Canned results per method, optionally per
/// `method:first_param`.
pub struct MockRpc {
    pub url: String,
    pub state: Arc<MockState>,
}

#[derive(Default)]
pub struct MockState {
    pub results: Mutex<HashMap<String, Value>>,
    /// respond 503 to everything when set
    pub fail_with_503: AtomicBool,
    /// number of http requests received
    pub hits: AtomicU64,
    /// every json-rpc request body seen, flattened
    pub requests: Mutex<Vec<Value>>,
}

impl MockState {
    fn answer_one(&self, req: &Value) -> Value {
        self.requests.lock().push(req.clone());

        let method = req["method"].as_str().unwrap_or_default();
        let id = req.get("id").cloned().unwrap_or(Value::Null);

        let by_param = req["params"][0]
            .as_str()
            .map(|param| format!("{}:{}", method, param));

        let results = self.results.lock();

        let result = by_param
            .and_then(|key| results.get(&key).cloned())
            .or_else(|| results.get(method).cloned());

        match result {
            Some(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            None => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "the method does not exist"},
            }),
        }
    }
}

async fn mock_handler(Extension(state): Extension<Arc<MockState>>, body: Bytes) -> Response {
    state.hits.fetch_add(1, Ordering::Relaxed);

    if state.fail_with_503.load(Ordering::Relaxed) {
        return (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response();
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(x) => x,
        Err(_) => return (StatusCode::BAD_REQUEST, "bad json").into_response(),
    };

    let answer = match &value {
        Value::Array(reqs) => Value::Array(reqs.iter().map(|req| state.answer_one(req)).collect()),
        req => state.answer_one(req),
    };

    Json(answer).into_response()
}

impl MockRpc {
    /// a node that looks healthy and synced at block 0x64
    pub async fn spawn() -> Self {
        let results = HashMap::from([
            ("eth_chainId".to_string(), json!("0x1")),
            ("net_version".to_string(), json!("1")),
            ("eth_syncing".to_string(), json!(false)),
            ("net_peerCount".to_string(), json!("0x10")),
            ("eth_blockNumber".to_string(), json!("0x64")),
            (
                "eth_getBlockByNumber:latest".to_string(),
                json!({"number": "0x64", "hash": "0xaa"}),
            ),
            (
                "eth_getBlockByNumber:safe".to_string(),
                json!({"number": "0x50", "hash": "0xbb"}),
            ),
            (
                "eth_getBlockByNumber:finalized".to_string(),
                json!({"number": "0x32", "hash": "0xcc"}),
            ),
            ("eth_getLogs".to_string(), json!([])),
            (
                "eth_sendRawTransaction".to_string(),
                json!(format!("0x{}", "11".repeat(32))),
            ),
        ]);

        let state = Arc::new(MockState {
            results: Mutex::new(results),
            ..Default::default()
        });

        let router = Router::new()
            .route("/", post(mock_handler))
            .layer(Extension(state.clone()));

        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(router.into_make_service());

        let addr = server.local_addr();

        tokio::spawn(server);

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub fn set_result(&self, key: &str, value: Value) {
        self.state.results.lock().insert(key.to_string(), value);
    }

    pub fn hits(&self) -> u64 {
        self.state.hits.load(Ordering::Relaxed)
    }

    /// requests recorded for the given method
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|req| req["method"] == json!(method))
            .cloned()
            .collect()
    }
}

/// The proxy under test plus a client pointed at it.
pub struct TestApp {
    pub proxy_url: String,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn(top_config: TopConfig) -> Self {
        let (app, _handles) = Web3GatewayApp::spawn(top_config).await.unwrap();

        let bound_port = Arc::new(AtomicU16::new(0));

        tokio::spawn(frontend::serve(0, app, bound_port.clone()));

        let start = Instant::now();
        let mut port = bound_port.load(Ordering::Relaxed);
        while port == 0 {
            if start.elapsed() > Duration::from_secs(5) {
                panic!("frontend took too long to start");
            }

            sleep(Duration::from_millis(10)).await;
            port = bound_port.load(Ordering::Relaxed);
        }

        Self {
            proxy_url: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
        }
    }

    pub async fn post(&self, body: Value) -> reqwest::Response {
        self.client
            .post(&self.proxy_url)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn post_raw(&self, body: String) -> reqwest::Response {
        self.client
            .post(&self.proxy_url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

/// a minimal config with one fallback group
pub fn basic_config(backends: &[(&str, &str)], mappings: &[(&str, &str)]) -> TopConfig {
    let backend_configs: serde_json::Map<String, Value> = backends
        .iter()
        .map(|(name, url)| {
            (
                name.to_string(),
                json!({"rpc_url": url, "max_retries": 0}),
            )
        })
        .collect();

    let backend_names: Vec<&str> = backends.iter().map(|(name, _)| *name).collect();

    let mappings: serde_json::Map<String, Value> = mappings
        .iter()
        .map(|(method, group)| (method.to_string(), json!(group)))
        .collect();

    serde_json::from_value(json!({
        "app": {
            "enable_served_by_header": true,
        },
        "backends": backend_configs,
        "backend_groups": {
            "main": {
                "backends": backend_names,
            },
        },
        "rpc_method_mappings": mappings,
    }))
    .unwrap()
}
