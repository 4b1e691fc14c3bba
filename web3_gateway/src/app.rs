//! Wires the pieces together and dispatches client requests.

use crate::block_number::RewriteResult;
use crate::config::{StorageKind, TopConfig, TxValidationConfig};
use crate::errors::{Web3GatewayError, Web3GatewayResult};
use crate::frontend::authorization::RequestContext;
use crate::jsonrpc::{
    JsonRpcForwardedResponse, JsonRpcForwardedResponseEnum, JsonRpcRequest,
};
use crate::rate_limit::{
    FrontendRateLimiter, MemoryRateLimiter, RateLimitResult, SenderRateLimiter,
};
use crate::response_cache::{CacheStorage, ResponseCache};
use crate::rpcs::consensus::{ConsensusPoller, ConsensusTracker, LocalTracker, RedisTracker};
use crate::rpcs::many::Web3BackendGroup;
use crate::rpcs::one::Web3Backend;
use crate::stats::ProxyMetrics;
use anyhow::Context;
use axum::extract::ws::WebSocket;
use axum::http::StatusCode;
use futures::stream::FuturesUnordered;
use hashbrown::{HashMap, HashSet};
use hyper::body::Bytes;
use serde_json::json;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use url::Url;

pub static APP_USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
);

/// What the http layer needs to build the final response.
#[derive(Debug)]
pub struct ProxyHttpResult {
    pub response: JsonRpcForwardedResponseEnum,
    pub status: StatusCode,
    pub served_by: Option<String>,
    pub cache_status: &'static str,
}

struct HandledBatch {
    responses: Vec<JsonRpcForwardedResponse>,
    statuses: Vec<Option<StatusCode>>,
    served_by: Vec<String>,
    any_cache_hit: bool,
}

/// The application
pub struct Web3GatewayApp {
    config: TopConfig,
    groups: HashMap<String, Arc<Web3BackendGroup>>,
    response_cache: Option<ResponseCache>,
    base_limiter: Option<FrontendRateLimiter>,
    method_limiters: HashMap<String, FrontendRateLimiter>,
    sender_limiter: Option<SenderRateLimiter>,
    tx_validator: Option<TxValidator>,
    ws_method_whitelist: Option<Arc<HashSet<String>>>,
    metrics: Arc<ProxyMetrics>,
}

impl Web3GatewayApp {
    pub async fn spawn(
        config: TopConfig,
    ) -> anyhow::Result<(
        Arc<Self>,
        FuturesUnordered<crate::AnyhowJoinHandle<()>>,
    )> {
        let metrics = Arc::new(ProxyMetrics::default());

        let handles = FuturesUnordered::new();

        let redis_pool = match &config.app.redis_url {
            Some(redis_url) => {
                info!("connecting to redis at {}", redis_url);

                let max_connections = config.app.redis_max_connections.unwrap_or(16);

                Some(redis_rate_limiter::new_redis_pool(
                    redis_url,
                    max_connections,
                )?)
            }
            None => {
                debug!("no redis configured");
                None
            }
        };

        // backends
        let mut backends: HashMap<String, Arc<Web3Backend>> = HashMap::new();
        for (name, backend_config) in &config.backends {
            let backend = Web3Backend::try_from_config(
                name.clone(),
                backend_config,
                config.app.proxy_ip.clone(),
                metrics.clone(),
            )
            .with_context(|| format!("backend {}", name))?;

            backends.insert(name.clone(), backend);
        }

        // groups, each with an optional consensus poller
        let mut groups: HashMap<String, Arc<Web3BackendGroup>> = HashMap::new();
        for (name, group_config) in &config.backend_groups {
            let poller = match &group_config.consensus {
                Some(consensus_config) => {
                    let tracker: Arc<dyn ConsensusTracker> = match (
                        &consensus_config.ha,
                        &redis_pool,
                    ) {
                        (Some(ha), Some(pool)) => {
                            let tracker = RedisTracker::new(pool.clone(), name, ha.clone());
                            handles.push(tracker.spawn_renewal());
                            tracker
                        }
                        (Some(_), None) => {
                            anyhow::bail!("group {} wants ha mode but no redis is configured", name)
                        }
                        (None, _) => Arc::new(LocalTracker),
                    };

                    let members = group_config
                        .backends
                        .iter()
                        .map(|backend_name| {
                            backends
                                .get(backend_name)
                                .cloned()
                                .with_context(|| format!("unknown backend {}", backend_name))
                        })
                        .collect::<anyhow::Result<Vec<_>>>()?;

                    let poller =
                        ConsensusPoller::new(members, consensus_config.clone(), tracker);

                    for handle in poller.spawn_polling() {
                        handles.push(handle);
                    }

                    Some(poller)
                }
                None => None,
            };

            let group = Web3BackendGroup::try_new(
                name.clone(),
                group_config,
                &backends,
                poller,
                metrics.clone(),
            )
            .with_context(|| format!("group {}", name))?;

            groups.insert(name.clone(), group);
        }

        // every mapped method must point at a real group
        for (method, group_name) in &config.rpc_method_mappings {
            if !groups.contains_key(group_name) {
                anyhow::bail!("method {} maps to unknown group {}", method, group_name);
            }
        }

        let response_cache = if config.cache.enabled {
            let ttl = Duration::from_secs(config.cache.ttl_seconds);

            let (primary, fallback) = match config.cache.storage {
                StorageKind::Memory => (
                    CacheStorage::new_memory(config.cache.max_items, ttl),
                    None,
                ),
                StorageKind::Redis => {
                    let pool = redis_pool
                        .clone()
                        .context("cache storage is redis but no redis is configured")?;

                    (CacheStorage::new_redis(pool, ttl), None)
                }
                StorageKind::RedisWithMemoryFallback => {
                    let pool = redis_pool
                        .clone()
                        .context("cache storage is redis but no redis is configured")?;

                    (
                        CacheStorage::new_redis(pool, ttl),
                        Some(CacheStorage::new_memory(config.cache.max_items, ttl)),
                    )
                }
            };

            Some(ResponseCache::new(primary, fallback, metrics.clone()))
        } else {
            None
        };

        let build_limiter = |label: &str, max: u64, interval: Duration| -> FrontendRateLimiter {
            match (config.rate_limit.storage, &redis_pool) {
                (StorageKind::Memory, _) | (_, None) => {
                    FrontendRateLimiter::Memory(MemoryRateLimiter::new(max, interval))
                }
                (StorageKind::Redis, Some(pool)) => {
                    FrontendRateLimiter::Redis(redis_rate_limiter::RedisRateLimiter::new(
                        "web3_gateway",
                        label,
                        max,
                        interval.as_secs_f32(),
                        pool.clone(),
                    ))
                }
                (StorageKind::RedisWithMemoryFallback, Some(pool)) => {
                    FrontendRateLimiter::RedisWithMemoryFallback(
                        redis_rate_limiter::RedisRateLimiter::new(
                            "web3_gateway",
                            label,
                            max,
                            interval.as_secs_f32(),
                            pool.clone(),
                        ),
                        MemoryRateLimiter::new(max, interval),
                    )
                }
            }
        };

        let base_limiter = if config.rate_limit.base_rate > 0 {
            Some(build_limiter(
                "frontend",
                config.rate_limit.base_rate,
                Duration::from_secs(config.rate_limit.base_interval_seconds),
            ))
        } else {
            None
        };

        let method_limiters = config
            .rate_limit
            .method_overrides
            .iter()
            .map(|(method, method_override)| {
                let limiter = build_limiter(
                    method,
                    method_override.limit,
                    Duration::from_secs(method_override.interval_seconds),
                );

                (method.clone(), limiter)
            })
            .collect();

        let sender_limiter = if config.sender_rate_limit.enabled {
            let limiter = build_limiter(
                "sender",
                config.sender_rate_limit.limit,
                Duration::from_secs(config.sender_rate_limit.interval_seconds),
            );

            Some(SenderRateLimiter::new(
                config.sender_rate_limit.allowed_chain_ids.clone(),
                limiter,
            ))
        } else {
            None
        };

        let tx_validator = TxValidator::try_from_config(&config.tx_validation)?;

        let ws_method_whitelist = config
            .app
            .ws_method_whitelist
            .as_ref()
            .map(|methods| Arc::new(methods.iter().cloned().collect::<HashSet<String>>()));

        let app = Arc::new(Self {
            config,
            groups,
            response_cache,
            base_limiter,
            method_limiters,
            sender_limiter,
            tx_validator,
            ws_method_whitelist,
            metrics,
        });

        Ok((app, handles))
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn ip_header(&self) -> &str {
        &self.config.app.ip_header
    }

    pub fn max_body_size(&self) -> usize {
        self.config.app.max_body_size_bytes
    }

    pub fn check_auth(&self, auth_alias: Option<&str>) -> Web3GatewayResult<()> {
        if self.config.app.authenticated_paths.is_empty() {
            // no auth configured. everyone is welcome
            return Ok(());
        }

        match auth_alias {
            Some(alias)
                if self
                    .config
                    .app
                    .authenticated_paths
                    .iter()
                    .any(|x| x == alias) =>
            {
                Ok(())
            }
            _ => Err(Web3GatewayError::Unauthorized),
        }
    }

    /// the http entrypoint. everything behind it runs under one deadline
    pub async fn proxy_web3_rpc(
        &self,
        ctx: &RequestContext,
        body: Bytes,
    ) -> Web3GatewayResult<ProxyHttpResult> {
        if body.len() > self.config.app.max_body_size_bytes {
            return Err(Web3GatewayError::RequestBodyTooLarge {
                max: self.config.app.max_body_size_bytes,
            });
        }

        match timeout(
            self.config.app.request_timeout(),
            self.proxy_inner(ctx, &body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Web3GatewayError::GatewayTimeout),
        }
    }

    async fn proxy_inner(
        &self,
        ctx: &RequestContext,
        body: &[u8],
    ) -> Web3GatewayResult<ProxyHttpResult> {
        // the first non-whitespace byte decides whether this is a batch
        let is_batch = match body.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'[') => true,
            Some(_) => false,
            None => return Err(Web3GatewayError::ParseError),
        };

        let items: Vec<Web3GatewayResult<JsonRpcRequest>> = if is_batch {
            let raw: Vec<serde_json::Value> =
                serde_json::from_slice(body).map_err(|_| Web3GatewayError::ParseError)?;

            if raw.is_empty() {
                return Err(Web3GatewayError::InvalidRequest("empty batch".into()));
            }

            if raw.len() > self.config.app.max_batch_size {
                return Err(Web3GatewayError::TooManyBatchRequests {
                    max: self.config.app.max_batch_size,
                });
            }

            raw.into_iter()
                .map(|value| {
                    serde_json::from_value(value).map_err(|_| Web3GatewayError::ParseError)
                })
                .collect()
        } else {
            let req: JsonRpcRequest =
                serde_json::from_slice(body).map_err(|_| Web3GatewayError::ParseError)?;

            vec![Ok(req)]
        };

        let handled = self.handle_many(ctx, items, is_batch).await?;

        let cache_status = if handled.any_cache_hit { "HIT" } else { "MISS" };

        let served_by = if self.config.app.enable_served_by_header
            && !handled.served_by.is_empty()
        {
            Some(handled.served_by.join(", "))
        } else {
            None
        };

        if is_batch {
            Ok(ProxyHttpResult {
                response: JsonRpcForwardedResponseEnum::Batch(handled.responses),
                status: StatusCode::OK,
                served_by,
                cache_status,
            })
        } else {
            let status = handled.statuses[0].unwrap_or(StatusCode::OK);

            let response = handled
                .responses
                .into_iter()
                .next()
                .expect("a single request always has a response");

            Ok(ProxyHttpResult {
                response: JsonRpcForwardedResponseEnum::Single(response),
                status,
                served_by,
                cache_status,
            })
        }
    }

    /// Validate, rate limit, bucket, forward, and merge. The response array
    /// always lines up with the request array, duplicates included.
    async fn handle_many(
        &self,
        ctx: &RequestContext,
        items: Vec<Web3GatewayResult<JsonRpcRequest>>,
        is_batch: bool,
    ) -> Web3GatewayResult<HandledBatch> {
        let total = items.len();

        let mut responses: Vec<Option<JsonRpcForwardedResponse>> = vec![None; total];
        let mut statuses: Vec<Option<StatusCode>> = vec![None; total];
        let mut served_by: Vec<String> = Vec::new();
        let mut any_cache_hit = false;

        // requests sharing an id go to separate buckets so upstream batches
        // never contain duplicates and merging stays positional
        let mut dup_counts: HashMap<String, usize> = HashMap::new();
        let mut buckets: HashMap<(String, usize), Vec<(usize, JsonRpcRequest)>> = HashMap::new();

        for (i, item) in items.into_iter().enumerate() {
            let req = match item {
                Ok(req) => req,
                Err(err) => {
                    let (status, data) = err.as_response_parts();
                    responses[i] = Some(JsonRpcForwardedResponse::from_response_data(
                        data,
                        crate::jsonrpc::null_id(),
                    ));
                    statuses[i] = Some(status);
                    continue;
                }
            };

            if let Err(msg) = req.validate() {
                let err = Web3GatewayError::InvalidRequest(msg);
                let (status, data) = err.as_response_parts();
                responses[i] =
                    Some(JsonRpcForwardedResponse::from_response_data(data, req.id.clone()));
                statuses[i] = Some(status);
                continue;
            }

            // a few methods never reach a backend
            if let RewriteResult::OverrideResponse(res) = self.intercept(&req) {
                responses[i] = Some(res);
                continue;
            }

            let group_name = match self.config.rpc_method_mappings.get(&req.method) {
                Some(x) => x.clone(),
                None => {
                    let err = Web3GatewayError::MethodNotWhitelisted(req.method.clone().into());
                    let (status, data) = err.as_response_parts();
                    responses[i] = Some(JsonRpcForwardedResponse::from_response_data(
                        data,
                        req.id.clone(),
                    ));
                    statuses[i] = Some(status);
                    continue;
                }
            };

            if let Some(err) = self.apply_rate_limits(ctx, &req).await {
                let (status, data) = err.as_response_parts();
                responses[i] =
                    Some(JsonRpcForwardedResponse::from_response_data(data, req.id.clone()));
                statuses[i] = Some(status);
                continue;
            }

            if req.method == "eth_sendRawTransaction"
                || req.method == "eth_sendRawTransactionConditional"
            {
                if let Some(err) = self.check_raw_tx(&req).await {
                    let (status, data) = err.as_response_parts();
                    responses[i] = Some(JsonRpcForwardedResponse::from_response_data(
                        data,
                        req.id.clone(),
                    ));
                    statuses[i] = Some(status);
                    continue;
                }
            }

            let id_key = req.id.get().to_string();
            let dup_index = {
                let count = dup_counts.entry(id_key).or_insert(0);
                let index = *count;
                *count += 1;
                index
            };

            buckets
                .entry((group_name, dup_index))
                .or_default()
                .push((i, req));
        }

        for ((group_name, _dup_index), entries) in buckets {
            let group = self
                .groups
                .get(&group_name)
                .expect("mappings are validated at startup");

            let nums = group.consensus_block_numbers();

            // serve what we can from cache
            let mut misses: Vec<(usize, JsonRpcRequest)> = Vec::with_capacity(entries.len());

            for (i, req) in entries {
                if let Some(cache) = &self.response_cache {
                    if let Some(hit) =
                        cache.get(&req, &ctx.forwarded_headers(), &nums).await
                    {
                        self.metrics.cache_hit();
                        any_cache_hit = true;
                        responses[i] = Some(hit);
                        continue;
                    }

                    self.metrics.cache_miss();
                }

                misses.push((i, req));
            }

            // what's left goes upstream in mini-batches
            let chunk_size = if self.config.app.max_upstream_batch_size == 0 {
                misses.len().max(1)
            } else {
                self.config.app.max_upstream_batch_size
            };

            let mut remaining = misses;

            while !remaining.is_empty() {
                let tail = remaining.split_off(chunk_size.min(remaining.len()));
                let chunk = std::mem::replace(&mut remaining, tail);

                let (indexes, reqs): (Vec<usize>, Vec<JsonRpcRequest>) =
                    chunk.into_iter().unzip();

                match group.forward(ctx, reqs.clone(), is_batch).await {
                    Ok((answered, backend_label)) => {
                        if let Some(label) = backend_label {
                            if !served_by.contains(&label) {
                                served_by.push(label);
                            }
                        }

                        for ((i, req), res) in
                            indexes.into_iter().zip(reqs).zip(answered)
                        {
                            if let Some(cache) = &self.response_cache {
                                cache
                                    .put(&req, &res, &ctx.forwarded_headers(), &nums)
                                    .await;
                            }

                            responses[i] = Some(res);
                        }
                    }
                    Err(err) => {
                        // the whole chunk failed. every request gets the error
                        let (status, data) = err.as_response_parts();

                        for (i, req) in indexes.into_iter().zip(reqs) {
                            responses[i] = Some(JsonRpcForwardedResponse::from_response_data(
                                data.clone(),
                                req.id.clone(),
                            ));
                            statuses[i] = Some(status);
                        }
                    }
                }
            }
        }

        let responses = responses
            .into_iter()
            .map(|x| x.expect("every request index was answered"))
            .collect();

        Ok(HandledBatch {
            responses,
            statuses,
            served_by,
            any_cache_hit,
        })
    }

    /// methods with hardcoded answers
    fn intercept(&self, req: &JsonRpcRequest) -> RewriteResult {
        match req.method.as_str() {
            "proxyd_healthz" => RewriteResult::OverrideResponse(
                JsonRpcForwardedResponse::from_value(json!("OK"), req.id.clone()),
            ),
            "eth_accounts" => RewriteResult::OverrideResponse(
                JsonRpcForwardedResponse::from_value(json!([]), req.id.clone()),
            ),
            _ => RewriteResult::None,
        }
    }

    /// base limit plus the per-method override, both keyed by client ip.
    /// limiter transport errors fail open
    async fn apply_rate_limits(
        &self,
        ctx: &RequestContext,
        req: &JsonRpcRequest,
    ) -> Option<Web3GatewayError> {
        if let Some(limiter) = &self.base_limiter {
            match limiter.take(&ctx.client_ip, 1).await {
                Ok(RateLimitResult::Allowed) => {}
                Ok(_) => {
                    self.metrics.rate_limit_take(false);
                    return Some(Web3GatewayError::OverRateLimit);
                }
                Err(err) => {
                    warn!(?err, "rate limiter failed. allowing");
                }
            }
            self.metrics.rate_limit_take(true);
        }

        if let Some(limiter) = self.method_limiters.get(&req.method) {
            let key = format!("{}:{}", req.method, ctx.client_ip);

            match limiter.take(&key, 1).await {
                Ok(RateLimitResult::Allowed) => {}
                Ok(_) => {
                    self.metrics.rate_limit_take(false);
                    return Some(Web3GatewayError::OverRateLimit);
                }
                Err(err) => {
                    warn!(?err, "method rate limiter failed. allowing");
                }
            }
        }

        None
    }

    /// sender quota and the validation middleware, for raw transactions only
    async fn check_raw_tx(&self, req: &JsonRpcRequest) -> Option<Web3GatewayError> {
        let raw = match req
            .params
            .as_ref()
            .and_then(|p| p.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
        {
            Some(raw) => raw,
            None => {
                return Some(Web3GatewayError::InvalidParams(
                    "expected a raw transaction".into(),
                ))
            }
        };

        if let Some(limiter) = &self.sender_limiter {
            if let Err(err) = limiter.check_raw_tx(raw).await {
                return Some(err);
            }
        }

        if let Some(validator) = &self.tx_validator {
            if let Err(err) = validator.validate(raw).await {
                return Some(err);
            }
        }

        None
    }

    /// upgrade path: pick a backend with a ws endpoint and pump frames
    pub async fn proxy_ws(&self, ctx: RequestContext, client: WebSocket) -> Web3GatewayResult<()> {
        let group_name = self
            .config
            .app
            .ws_backend_group
            .as_ref()
            .ok_or(Web3GatewayError::NoBackends)?;

        let group = self
            .groups
            .get(group_name)
            .ok_or(Web3GatewayError::NoBackends)?;

        let backend = group.ws_backend()?;

        let (stream, guard) = backend.dial_ws().await?;

        debug!(request_id=%ctx.request_id, backend=%backend.name, "ws session opened");

        let proxier = crate::frontend::ws_proxy::WsProxier::new(
            client,
            stream,
            backend.name.clone(),
            self.ws_method_whitelist.clone(),
            self.metrics.clone(),
            guard,
        );

        proxier.run().await
    }
}

/// Opaque middleware call that vets raw transactions before forwarding.
pub struct TxValidator {
    url: Url,
    fail_open: bool,
    client: reqwest::Client,
}

impl TxValidator {
    pub fn try_from_config(config: &TxValidationConfig) -> anyhow::Result<Option<Self>> {
        let url = match &config.url {
            Some(url) => url.parse().context("invalid tx_validation url")?,
            None => return Ok(None),
        };

        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(APP_USER_AGENT)
            .build()
            .context("building tx validation client")?;

        Ok(Some(Self {
            url,
            fail_open: config.fail_open,
            client,
        }))
    }

    pub async fn validate(&self, raw_tx: &str) -> Web3GatewayResult<()> {
        let result = self
            .client
            .post(self.url.clone())
            .json(&json!({ "rawTx": raw_tx }))
            .send()
            .await;

        let response = match result {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => return self.middleware_failed(response.status().as_u16()),
            Err(err) => {
                warn!(?err, "tx validation middleware unreachable");
                return self.middleware_failed(0);
            }
        };

        #[derive(serde::Deserialize)]
        struct Verdict {
            valid: bool,
            #[serde(default)]
            reason: Option<String>,
        }

        match response.json::<Verdict>().await {
            Ok(verdict) if verdict.valid => Ok(()),
            Ok(verdict) => Err(Web3GatewayError::InvalidParams(
                verdict
                    .reason
                    .unwrap_or_else(|| "transaction rejected".to_string())
                    .into(),
            )),
            Err(err) => {
                warn!(?err, "tx validation middleware returned garbage");
                self.middleware_failed(0)
            }
        }
    }

    /// a broken middleware is not the client's fault unless configured so
    fn middleware_failed(&self, status: u16) -> Web3GatewayResult<()> {
        if self.fail_open {
            debug!(status, "tx validation failed open");
            Ok(())
        } else {
            Err(Web3GatewayError::InvalidParams(
                "transaction validation unavailable".into(),
            ))
        }
    }
}
