//! One upstream execution node and everything needed to talk to it safely.

use crate::config::{BackendConfig, ReceiptsTarget};
use crate::errors::{Web3GatewayError, Web3GatewayResult};
use crate::frontend::authorization::RequestContext;
use crate::jsonrpc::{JsonRpcForwardedResponse, JsonRpcRequest};
use crate::stats::{BackendWindows, ProxyMetrics};
use anyhow::Context;
use futures::StreamExt;
use hashbrown::HashMap;
use nanorand::{Rng, WyRand};
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

pub type BackendWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// the longest a retry will ever wait
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(3);
const BASE_RETRY_BACKOFF_MS: u64 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

pub struct Web3Backend {
    pub name: String,
    rpc_url: Url,
    ws_url: Option<Url>,
    ingress_url: Option<Url>,

    http_client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
    static_headers: Vec<(String, String)>,
    strip_trailing_xff: bool,
    proxy_ip: String,

    max_retries: u32,
    max_response_size: u64,
    allowed_response_codes: Vec<u16>,
    /// bounds concurrent in-flight requests when configured
    semaphore: Option<Semaphore>,
    active_ws_conns: AtomicU32,
    max_ws_conns: u32,

    pub(crate) weight: u32,
    receipts_target: ReceiptsTarget,

    // read by the consensus poller
    pub(crate) skip_peer_count_check: bool,
    pub(crate) skip_syncing_check: bool,
    pub(crate) forced_candidate: bool,
    pub(crate) max_safe_block_drift: Option<u64>,
    pub(crate) max_finalized_block_drift: Option<u64>,

    windows: BackendWindows,
    max_latency: Duration,
    max_degraded_latency: Duration,
    max_error_rate: f64,

    metrics: Arc<ProxyMetrics>,
}

impl fmt::Display for Web3Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Web3Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Web3Backend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Web3Backend {
    pub fn try_from_config(
        name: String,
        config: &BackendConfig,
        proxy_ip: String,
        metrics: Arc<ProxyMetrics>,
    ) -> anyhow::Result<Arc<Self>> {
        let rpc_url: Url = config.rpc_url.parse().context("invalid rpc_url")?;
        let ws_url = config
            .ws_url
            .as_deref()
            .map(|x| x.parse().context("invalid ws_url"))
            .transpose()?;
        let ingress_url = config
            .ingress_url
            .as_deref()
            .map(|x| x.parse().context("invalid ingress_url"))
            .transpose()?;

        let mut client_builder = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(crate::app::APP_USER_AGENT);

        if config.tls_insecure_skip_verify {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let semaphore = if config.max_rps > 0 {
            Some(Semaphore::new(config.max_rps as usize))
        } else {
            None
        };

        let backend = Self {
            name,
            rpc_url,
            ws_url,
            ingress_url,
            http_client: client_builder.build().context("building http client")?,
            username: config.username.clone(),
            password: config.password.clone(),
            static_headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            strip_trailing_xff: config.strip_trailing_xff,
            proxy_ip,
            max_retries: config.max_retries,
            max_response_size: config.max_response_size_bytes,
            allowed_response_codes: config.allowed_response_codes.clone(),
            semaphore,
            active_ws_conns: AtomicU32::new(0),
            max_ws_conns: config.max_ws_conns,
            weight: config.weight,
            receipts_target: config.consensus_receipts_target,
            skip_peer_count_check: config.consensus_skip_peer_count_check,
            skip_syncing_check: config.consensus_skip_syncing_check,
            forced_candidate: config.consensus_forced_candidate,
            max_safe_block_drift: config.consensus_max_safe_block_drift,
            max_finalized_block_drift: config.consensus_max_finalized_block_drift,
            windows: Default::default(),
            max_latency: Duration::from_millis(config.max_latency_threshold_ms),
            max_degraded_latency: Duration::from_millis(config.max_degraded_latency_threshold_ms),
            max_error_rate: config.max_error_rate_threshold,
            metrics,
        };

        Ok(Arc::new(backend))
    }

    pub fn has_ws(&self) -> bool {
        self.ws_url.is_some()
    }

    /// classification consulted by groups when ordering backends
    pub fn health(&self) -> BackendHealth {
        let avg_latency = self.windows.latency.duration();

        if avg_latency >= self.max_latency || self.windows.error_rate() >= self.max_error_rate {
            BackendHealth::Unhealthy
        } else if avg_latency >= self.max_degraded_latency {
            BackendHealth::Degraded
        } else {
            BackendHealth::Healthy
        }
    }

    /// Send requests upstream and give the responses back in request order.
    ///
    /// An `Err` here means the backend could not produce a full answer. RPC
    /// errors inside the envelopes are not errors at this level.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        reqs: &[JsonRpcRequest],
        _is_batch: bool,
    ) -> Web3GatewayResult<Vec<JsonRpcForwardedResponse>> {
        debug_assert!(!reqs.is_empty());

        // vendor dialect translation. batches of these don't have a sane answer
        let translated: Option<(Vec<JsonRpcRequest>, &'static str)> =
            if reqs.iter().any(|r| r.method == "consensus_getReceipts") {
                if reqs.len() > 1 {
                    return Err(Web3GatewayError::ConsensusGetReceiptsCantBeBatched);
                }

                let (req, method) = self.translate_get_receipts(&reqs[0])?;

                Some((vec![req], method))
            } else {
                None
            };

        let (reqs, tag_method) = match &translated {
            Some((reqs, method)) => (reqs.as_slice(), Some(*method)),
            None => (reqs, None),
        };

        let _permit = match &self.semaphore {
            Some(semaphore) => Some(
                semaphore
                    .acquire()
                    .await
                    .map_err(|_| Web3GatewayError::TooManyRequests)?,
            ),
            None => None,
        };

        let mut attempt = 0;

        loop {
            let start = Instant::now();

            let result = self.try_forward(ctx, reqs).await;

            let elapsed = start.elapsed();
            self.windows.requests.incr();
            self.windows.latency.record(elapsed);
            self.metrics.backend_latency(&self.name, elapsed);

            match result {
                Ok(mut responses) => {
                    for res in &responses {
                        if let Some(err) = &res.error {
                            self.metrics.rpc_error(&self.name, err.code);
                        }
                    }

                    if let Some(method) = tag_method {
                        responses[0].tag_with_method(method);
                    }

                    return Ok(responses);
                }
                Err(err) => {
                    if counts_against_error_window(&err) {
                        self.windows.errors.incr();
                        self.metrics.backend_network_error(&self.name);
                    }

                    if !err.is_retryable() || attempt >= self.max_retries {
                        return Err(err);
                    }

                    let backoff = retry_backoff(attempt);
                    trace!(backend=%self.name, attempt, ?backoff, ?err, "retrying");
                    sleep(backoff).await;

                    attempt += 1;
                }
            }
        }
    }

    /// Single-call convenience used by the pollers.
    pub async fn forward_rpc(
        &self,
        ctx: &RequestContext,
        id: u64,
        method: &str,
        params: serde_json::Value,
    ) -> Web3GatewayResult<JsonRpcForwardedResponse> {
        let req = JsonRpcRequest::internal(id, method, params);

        let mut responses = self.forward(ctx, &[req], false).await?;

        Ok(responses.pop().expect("one request yields one response"))
    }

    async fn try_forward(
        &self,
        ctx: &RequestContext,
        reqs: &[JsonRpcRequest],
    ) -> Web3GatewayResult<Vec<JsonRpcForwardedResponse>> {
        // single-element batches are unwrapped before they hit the upstream
        let body = if reqs.len() == 1 {
            serde_json::to_vec(&reqs[0])?
        } else {
            serde_json::to_vec(&reqs)?
        };

        self.mirror_to_ingress(&body);

        let mut request = self
            .http_client
            .post(self.rpc_url.clone())
            .header(CONTENT_TYPE, "application/json");

        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        for (name, value) in &self.static_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let xff = if self.strip_trailing_xff {
            ctx.xff
                .split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        } else if ctx.xff.is_empty() {
            self.proxy_ip.clone()
        } else {
            format!("{}, {}", ctx.xff, self.proxy_ip)
        };

        if !xff.is_empty() {
            request = request.header("X-Forwarded-For", xff);
        }

        if let Some(signature) = &ctx.auth_signature {
            request = request.header("X-Optimism-Signature", signature);
        }

        let response = request.body(body).send().await?;

        let status = response.status();

        let body = self.read_capped(response).await?;

        let status_carries_rpc_body = status.as_u16() == 200
            || status.as_u16() == 400
            || self.allowed_response_codes.contains(&status.as_u16());

        if !status_carries_rpc_body {
            return Err(match status.as_u16() {
                429 => Web3GatewayError::BackendOverCapacity,
                s if s >= 500 => Web3GatewayError::BackendOffline,
                s => Web3GatewayError::BackendBadResponse(
                    format!("unexpected status {}", s).into(),
                ),
            });
        }

        if reqs.len() == 1 {
            let res: JsonRpcForwardedResponse = serde_json::from_slice(&body)
                .map_err(|_| Web3GatewayError::BackendBadResponse("response is not json-rpc".into()))?;

            return Ok(vec![res]);
        }

        // a bare object answering a batch is a known vendor quirk, not a response
        if body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
            return Err(Web3GatewayError::UnexpectedJsonRpc);
        }

        let responses: Vec<JsonRpcForwardedResponse> = serde_json::from_slice(&body)
            .map_err(|_| Web3GatewayError::BackendBadResponse("response is not json-rpc".into()))?;

        if responses.len() != reqs.len() {
            return Err(Web3GatewayError::BackendBadResponse(
                "response count does not match request count".into(),
            ));
        }

        // responses come back in whatever order the upstream felt like.
        // re-sort them to request order by id
        let mut by_id: HashMap<String, JsonRpcForwardedResponse> = responses
            .into_iter()
            .map(|res| (res.id.get().to_string(), res))
            .collect();

        // duplicate ids in one upstream call are a dispatcher bug
        assert_eq!(by_id.len(), reqs.len(), "duplicate ids in upstream batch");

        reqs.iter()
            .map(|req| {
                by_id.remove(req.id.get()).ok_or_else(|| {
                    Web3GatewayError::BackendBadResponse("response id does not match any request".into())
                })
            })
            .collect()
    }

    async fn read_capped(&self, response: reqwest::Response) -> Web3GatewayResult<Vec<u8>> {
        let mut stream = response.bytes_stream();

        let mut body = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;

            if (body.len() + chunk.len()) as u64 > self.max_response_size {
                return Err(Web3GatewayError::BackendResponseTooLarge {
                    max: self.max_response_size,
                });
            }

            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }

    /// mirror the exact upstream body to the ingress endpoint. failures are
    /// logged and never propagated
    fn mirror_to_ingress(&self, body: &[u8]) {
        let url = match &self.ingress_url {
            Some(url) => url.clone(),
            None => return,
        };

        let client = self.http_client.clone();
        let body = body.to_vec();
        let name = self.name.clone();

        tokio::spawn(async move {
            if let Err(err) = client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
            {
                debug!(?err, backend=%name, "ingress mirror failed");
            }
        });
    }

    fn translate_get_receipts(
        &self,
        req: &JsonRpcRequest,
    ) -> Web3GatewayResult<(JsonRpcRequest, &'static str)> {
        let block_ref = match req.params.as_ref().and_then(|p| p.as_array()).and_then(|a| a.first())
        {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Object(obj)) => obj
                .get("blockNumber")
                .or_else(|| obj.get("blockHash"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or(Web3GatewayError::InvalidParams(
                    "expected a block number or hash".into(),
                ))?,
            _ => {
                return Err(Web3GatewayError::InvalidParams(
                    "consensus_getReceipts needs a block number or hash".into(),
                ))
            }
        };

        // 32-byte hashes are 66 chars with the prefix
        let is_hash = block_ref.len() == 66;

        let (method, params) = match self.receipts_target {
            ReceiptsTarget::DebugGetRawReceipts => ("debug_getRawReceipts", json!([block_ref])),
            ReceiptsTarget::EthGetBlockReceipts => ("eth_getBlockReceipts", json!([block_ref])),
            ReceiptsTarget::ParityGetBlockReceipts => {
                ("parity_getBlockReceipts", json!([block_ref]))
            }
            ReceiptsTarget::AlchemyGetTransactionReceipts => {
                let param = if is_hash {
                    json!({ "blockHash": block_ref })
                } else {
                    json!({ "blockNumber": block_ref })
                };

                ("alchemy_getTransactionReceipts", json!([param]))
            }
        };

        trace!(backend=%self.name, %method, "translated consensus_getReceipts");

        Ok((
            JsonRpcRequest::new(req.id.clone(), method.to_string(), Some(params)),
            method,
        ))
    }

    /// Dial the websocket endpoint, respecting the connection cap.
    pub async fn dial_ws(self: &Arc<Self>) -> Web3GatewayResult<(BackendWsStream, WsConnGuard)> {
        let url = self
            .ws_url
            .as_ref()
            .ok_or(Web3GatewayError::BackendOffline)?;

        if self.max_ws_conns > 0
            && self.active_ws_conns.load(Ordering::Acquire) >= self.max_ws_conns
        {
            return Err(Web3GatewayError::BackendOverCapacity);
        }

        let (stream, _) = connect_async(url.as_str()).await?;

        self.active_ws_conns.fetch_add(1, Ordering::AcqRel);

        Ok((stream, WsConnGuard(self.clone())))
    }
}

/// decrements the connection count when the proxied socket ends
pub struct WsConnGuard(Arc<Web3Backend>);

impl Drop for WsConnGuard {
    fn drop(&mut self) {
        self.0.active_ws_conns.fetch_sub(1, Ordering::AcqRel);
    }
}

/// only transport-level failures count toward the error window
fn counts_against_error_window(err: &Web3GatewayError) -> bool {
    matches!(
        err,
        Web3GatewayError::Reqwest(_) | Web3GatewayError::BackendOffline
    )
}

fn retry_backoff(attempt: u32) -> Duration {
    let mut rng = WyRand::new();

    let base = BASE_RETRY_BACKOFF_MS.saturating_mul(1u64 << attempt.min(10));
    let jitter = rng.generate_range(0..=BASE_RETRY_BACKOFF_MS);

    Duration::from_millis(base + jitter).min(MAX_RETRY_BACKOFF)
}
