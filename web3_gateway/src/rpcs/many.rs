//! A named set of backends and the strategy for spreading requests across it.

use crate::block_number::{rewrite_tags, RewriteResult};
use crate::config::{BackendGroupConfig, RoutingStrategy};
use crate::errors::{Web3GatewayError, Web3GatewayResult};
use crate::frontend::authorization::RequestContext;
use crate::jsonrpc::{JsonRpcForwardedResponse, JsonRpcRequest};
use crate::rpcs::consensus::ConsensusPoller;
use crate::rpcs::one::{BackendHealth, Web3Backend};
use crate::stats::ProxyMetrics;
use anyhow::Context;
use hashbrown::{HashMap, HashSet};
use nanorand::{Rng, WyRand};
use std::sync::Arc;
use tracing::{debug, trace};

impl std::fmt::Debug for Web3BackendGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Web3BackendGroup")
            .field("name", &self.name)
            .finish()
    }
}

pub struct Web3BackendGroup {
    pub name: String,
    backends: Vec<Arc<Web3Backend>>,
    fallback_names: HashSet<String>,
    routing: RoutingStrategy,
    weighted: bool,
    pub(crate) consensus: Option<Arc<ConsensusPoller>>,
    pub(crate) max_block_range: u64,
    metrics: Arc<ProxyMetrics>,
}

impl Web3BackendGroup {
    pub fn try_new(
        name: String,
        config: &BackendGroupConfig,
        all_backends: &HashMap<String, Arc<Web3Backend>>,
        consensus: Option<Arc<ConsensusPoller>>,
        metrics: Arc<ProxyMetrics>,
    ) -> anyhow::Result<Arc<Self>> {
        let backends: Vec<Arc<Web3Backend>> = config
            .backends
            .iter()
            .map(|backend_name| {
                all_backends
                    .get(backend_name)
                    .cloned()
                    .with_context(|| format!("unknown backend {}", backend_name))
            })
            .collect::<anyhow::Result<_>>()?;

        for fallback in &config.fallbacks {
            if !config.backends.contains(fallback) {
                anyhow::bail!("fallback {} is not a member of group {}", fallback, name);
            }
        }

        Ok(Arc::new(Self {
            name,
            backends,
            fallback_names: config.fallbacks.iter().cloned().collect(),
            routing: config.routing,
            weighted: config.weighted_routing,
            consensus,
            max_block_range: config.max_block_range,
            metrics,
        }))
    }

    pub fn consensus_block_numbers(&self) -> crate::block_number::BlockNumbers {
        self.consensus
            .as_ref()
            .map(|poller| poller.block_numbers())
            .unwrap_or_default()
    }

    /// Forward a mini-batch, answering what the rewriter already knows and
    /// splicing those answers back at their original indices.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        reqs: Vec<JsonRpcRequest>,
        is_batch: bool,
    ) -> Web3GatewayResult<(Vec<JsonRpcForwardedResponse>, Option<String>)> {
        let total = reqs.len();

        let mut overrides: Vec<Option<JsonRpcForwardedResponse>> = vec![None; total];
        let mut forwarded: Vec<JsonRpcRequest> = Vec::with_capacity(total);
        let mut forwarded_idx: Vec<usize> = Vec::with_capacity(total);

        if let Some(poller) = &self.consensus {
            let nums = poller.block_numbers();

            for (i, mut req) in reqs.into_iter().enumerate() {
                match rewrite_tags(&mut req, &nums, self.max_block_range) {
                    RewriteResult::OverrideResponse(res) => {
                        overrides[i] = Some(res.with_id(req.id.clone()));
                    }
                    RewriteResult::OverrideError(err) => {
                        let (_, data) = err.as_response_parts();
                        overrides[i] =
                            Some(JsonRpcForwardedResponse::from_response_data(data, req.id.clone()));
                    }
                    RewriteResult::None | RewriteResult::OverrideRequest => {
                        forwarded_idx.push(i);
                        forwarded.push(req);
                    }
                }
            }
        } else {
            for (i, req) in reqs.into_iter().enumerate() {
                forwarded_idx.push(i);
                forwarded.push(req);
            }
        }

        if forwarded.is_empty() {
            let responses = overrides
                .into_iter()
                .map(|x| x.expect("every index was overridden"))
                .collect();

            return Ok((responses, None));
        }

        let single_raw_tx = !is_batch
            && forwarded.len() == 1
            && forwarded[0].method == "eth_sendRawTransaction";

        let (answered, served_by) =
            if self.routing == RoutingStrategy::Multicall && single_raw_tx {
                self.forward_multicall(ctx, forwarded[0].clone()).await?
            } else {
                self.forward_fallback(ctx, &forwarded, is_batch).await?
            };

        debug_assert_eq!(answered.len(), forwarded_idx.len());

        for (i, res) in forwarded_idx.into_iter().zip(answered) {
            overrides[i] = Some(res);
        }

        let responses = overrides
            .into_iter()
            .map(|x| x.expect("every index was filled"))
            .collect();

        Ok((responses, Some(served_by)))
    }

    /// try backends one at a time until one produces a full answer
    async fn forward_fallback(
        &self,
        ctx: &RequestContext,
        reqs: &[JsonRpcRequest],
        is_batch: bool,
    ) -> Web3GatewayResult<(Vec<JsonRpcForwardedResponse>, String)> {
        let ordered = self.ordered_backends();

        if ordered.is_empty() {
            self.metrics.unserviceable_request();
            return Err(Web3GatewayError::NoBackends);
        }

        for (i, backend) in ordered.iter().enumerate() {
            if i > 0 {
                self.metrics.group_fallback(&self.name, &backend.name);
            }

            match backend.forward(ctx, reqs, is_batch).await {
                Ok(responses) => {
                    trace!(group=%self.name, backend=%backend.name, "served");
                    return Ok((responses, format!("{}/{}", self.name, backend.name)));
                }
                Err(err) if err.is_short_circuit() => return Err(err),
                Err(err) => {
                    debug!(group=%self.name, backend=%backend.name, ?err, "trying next backend");
                }
            }
        }

        self.metrics.unserviceable_request();

        Err(Web3GatewayError::NoBackends)
    }

    /// fan a transaction out to everyone. detached from the caller so late
    /// backends still see the submission even if the client goes away
    async fn forward_multicall(
        &self,
        ctx: &RequestContext,
        req: JsonRpcRequest,
    ) -> Web3GatewayResult<(Vec<JsonRpcForwardedResponse>, String)> {
        let handles: Vec<_> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = backend.clone();
                let req = req.clone();
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let result = backend.forward(&ctx, &[req], false).await;

                    (backend.name.clone(), result)
                })
            })
            .collect();

        let mut winner: Option<(Vec<JsonRpcForwardedResponse>, String)> = None;
        let mut last_err = None;

        for handle in handles {
            let (backend_name, result) = match handle.await {
                Ok(x) => x,
                Err(err) => {
                    last_err = Some(Web3GatewayError::JoinError(err));
                    continue;
                }
            };

            match result {
                Ok(responses) => {
                    self.metrics.multicall_complete(&backend_name, true);

                    if winner.is_none() {
                        winner = Some((responses, format!("{}/{}", self.name, backend_name)));
                    }
                }
                Err(err) => {
                    self.metrics.multicall_complete(&backend_name, false);
                    debug!(backend=%backend_name, ?err, "multicall leg failed");
                    last_err = Some(err);
                }
            }
        }

        match winner {
            Some(x) => Ok(x),
            None => Err(last_err.unwrap_or(Web3GatewayError::NoBackends)),
        }
    }

    /// backend order for the fallback walk
    fn ordered_backends(&self) -> Vec<Arc<Web3Backend>> {
        let mut rng = WyRand::new();

        match self.routing {
            RoutingStrategy::ConsensusAware => {
                let members = match &self.consensus {
                    Some(poller) => poller.get_consensus_group(),
                    None => self.backends.clone(),
                };

                let mut healthy = Vec::new();
                let mut degraded = Vec::new();

                for backend in members {
                    match backend.health() {
                        BackendHealth::Healthy => healthy.push(backend),
                        BackendHealth::Degraded => degraded.push(backend),
                        BackendHealth::Unhealthy => {}
                    }
                }

                shuffle_backends(&mut rng, &mut healthy, self.weighted);
                shuffle_backends(&mut rng, &mut degraded, self.weighted);

                let mut ordered = healthy;
                ordered.append(&mut degraded);

                // last resort members still get a turn
                for backend in &self.backends {
                    if self.fallback_names.contains(&backend.name)
                        && !ordered.iter().any(|b| b.name == backend.name)
                    {
                        ordered.push(backend.clone());
                    }
                }

                ordered
            }
            RoutingStrategy::Fallback | RoutingStrategy::Multicall => {
                let members: Vec<Arc<Web3Backend>> = match &self.consensus {
                    Some(poller) => poller.get_consensus_group(),
                    None => self.backends.clone(),
                };

                let mut healthy = Vec::new();
                let mut degraded = Vec::new();
                let mut unhealthy = Vec::new();

                for backend in members {
                    if self.fallback_names.contains(&backend.name) {
                        continue;
                    }

                    match backend.health() {
                        BackendHealth::Healthy => healthy.push(backend),
                        BackendHealth::Degraded => degraded.push(backend),
                        BackendHealth::Unhealthy => unhealthy.push(backend),
                    }
                }

                let mut ordered = healthy;
                ordered.append(&mut degraded);
                ordered.append(&mut unhealthy);

                for backend in &self.backends {
                    if self.fallback_names.contains(&backend.name) {
                        ordered.push(backend.clone());
                    }
                }

                ordered
            }
        }
    }

    /// pick a backend for a new websocket connection
    pub fn ws_backend(&self) -> Web3GatewayResult<Arc<Web3Backend>> {
        self.ordered_backends()
            .into_iter()
            .find(|backend| backend.has_ws())
            .ok_or(Web3GatewayError::NoBackends)
    }
}

/// shuffle in place. with `weighted`, the chance of a backend landing at each
/// position is proportional to its weight among those remaining
fn shuffle_backends(rng: &mut WyRand, backends: &mut [Arc<Web3Backend>], weighted: bool) {
    let len = backends.len();

    if len < 2 {
        return;
    }

    if !weighted {
        for i in (1..len).rev() {
            let j = rng.generate_range(0..=i);
            backends.swap(i, j);
        }
        return;
    }

    for i in 0..len - 1 {
        let total: u64 = backends[i..].iter().map(|b| b.weight as u64).sum();

        // only zero-weight backends remain. leave them in config order
        if total == 0 {
            break;
        }

        let mut pick = rng.generate_range(0..total);
        let mut chosen = i;

        for (offset, backend) in backends[i..].iter().enumerate() {
            let weight = backend.weight as u64;

            if weight == 0 {
                continue;
            }

            if pick < weight {
                chosen = i + offset;
                break;
            }

            pick -= weight;
        }

        backends.swap(i, chosen);
    }
}
