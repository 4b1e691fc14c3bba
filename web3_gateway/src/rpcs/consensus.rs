//! Track which backends agree on the chain and what the agreed view is.
//!
//! Each backend gets its own poll task. A backend that diverges from the
//! group (wrong chain, syncing, starved of peers, lagging, drifting) is
//! banned for a while and routing stops seeing it.

use crate::block_number::BlockNumbers;
use crate::config::{ConsensusConfig, HaConfig};
use crate::frontend::authorization::RequestContext;
use crate::rpcs::one::Web3Backend;
use crate::AnyhowJoinHandle;
use anyhow::Context;
use async_trait::async_trait;
use ethers::types::U64;
use hashbrown::HashMap;
use nanorand::{Rng, WyRand};
use parking_lot::RwLock;
use redis_rate_limiter::redis;
use redis_rate_limiter::RedisPool;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// What the poller last learned about one backend.
#[derive(Debug, Default)]
pub(crate) struct BackendView {
    pub last_update: Option<Instant>,
    pub chain_id: Option<U64>,
    pub syncing: bool,
    pub peer_count: Option<U64>,
    pub latest: Option<U64>,
    pub safe: Option<U64>,
    pub finalized: Option<U64>,
    pub banned_until: Option<Instant>,
}

impl BackendView {
    fn is_banned(&self, now: Instant) -> bool {
        matches!(self.banned_until, Some(until) if until > now)
    }

    fn is_fresh(&self, now: Instant, max_age: Duration) -> bool {
        matches!(self.last_update, Some(at) if now.duration_since(at) <= max_age)
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConsensusState {
    pub views: HashMap<String, BackendView>,
    /// the chain every member must be on. pinned by the first healthy poll
    pub group_chain_id: Option<U64>,
    pub agreed: BlockNumbers,
}

pub struct ConsensusPoller {
    backends: Vec<Arc<Web3Backend>>,
    config: ConsensusConfig,
    state: RwLock<ConsensusState>,
    tracker: Arc<dyn ConsensusTracker>,
}

impl ConsensusPoller {
    pub fn new(
        backends: Vec<Arc<Web3Backend>>,
        config: ConsensusConfig,
        tracker: Arc<dyn ConsensusTracker>,
    ) -> Arc<Self> {
        let views = backends
            .iter()
            .map(|b| (b.name.clone(), BackendView::default()))
            .collect();

        Arc::new(Self {
            backends,
            config,
            state: RwLock::new(ConsensusState {
                views,
                group_chain_id: None,
                agreed: BlockNumbers::default(),
            }),
            tracker,
        })
    }

    /// one persistent task per backend
    pub fn spawn_polling(self: &Arc<Self>) -> Vec<AnyhowJoinHandle<()>> {
        self.backends
            .iter()
            .map(|backend| {
                let poller = self.clone();
                let backend = backend.clone();

                tokio::spawn(async move { poller.poll_loop(backend).await })
            })
            .collect()
    }

    async fn poll_loop(&self, backend: Arc<Web3Backend>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(err) = self.poll_backend_once(&backend).await {
                debug!(backend=%backend.name, ?err, "poll failed");
            }

            self.update_group().await;
        }
    }

    async fn poll_backend_once(&self, backend: &Arc<Web3Backend>) -> anyhow::Result<()> {
        let ctx = RequestContext::internal();

        let reqs = vec![
            crate::jsonrpc::JsonRpcRequest::internal(1, "eth_chainId", json!([])),
            crate::jsonrpc::JsonRpcRequest::internal(2, "eth_syncing", json!([])),
            crate::jsonrpc::JsonRpcRequest::internal(3, "net_peerCount", json!([])),
            crate::jsonrpc::JsonRpcRequest::internal(4, "eth_getBlockByNumber", json!(["latest", false])),
            crate::jsonrpc::JsonRpcRequest::internal(5, "eth_getBlockByNumber", json!(["safe", false])),
            crate::jsonrpc::JsonRpcRequest::internal(
                6,
                "eth_getBlockByNumber",
                json!(["finalized", false]),
            ),
        ];

        let responses = backend.forward(&ctx, &reqs, true).await.context("poll batch")?;

        let chain_id = hex_result(&responses[0]);
        let syncing = !matches!(
            responses[1].result,
            Some(serde_json::Value::Bool(false))
        );
        let peer_count = hex_result(&responses[2]);
        let latest = block_number_result(&responses[3]);
        let safe = block_number_result(&responses[4]);
        let finalized = block_number_result(&responses[5]);

        let latest = latest.context("backend returned no latest block")?;

        let now = Instant::now();
        let ban_until = now + self.config.ban_period();

        let mut state = self.state.write();

        if state.group_chain_id.is_none() {
            state.group_chain_id = chain_id;
        }
        let group_chain_id = state.group_chain_id;

        let view = state.views.entry(backend.name.clone()).or_default();

        view.last_update = Some(now);
        view.chain_id = chain_id;
        view.syncing = syncing;
        view.peer_count = peer_count;
        view.latest = Some(latest);
        view.safe = safe;
        view.finalized = finalized;

        if chain_id != group_chain_id {
            warn!(backend=%backend.name, ?chain_id, ?group_chain_id, "chain id mismatch. banning");
            view.banned_until = Some(ban_until);
        } else if syncing && !backend.skip_syncing_check {
            warn!(backend=%backend.name, "still syncing. banning");
            view.banned_until = Some(ban_until);
        } else if !backend.skip_peer_count_check
            && matches!(peer_count, Some(x) if x < U64::from(self.config.min_peer_count))
        {
            warn!(backend=%backend.name, ?peer_count, "not enough peers. banning");
            view.banned_until = Some(ban_until);
        }

        Ok(())
    }

    /// recompute the agreed tuple and apply the group-relative ban rules
    pub(crate) async fn update_group(&self) {
        let agreed = {
            let mut state = self.state.write();
            self.recompute(&mut state);
            state.agreed
        };

        if self.tracker.is_leader() {
            if let Err(err) = self.tracker.publish(&agreed).await {
                warn!(?err, "failed publishing consensus tuple");
            }
        } else {
            // read-only replica. trust the leader's tuple
            match self.tracker.read().await {
                Ok(Some(remote)) => {
                    let mut state = self.state.write();

                    // the exposed latest never goes backwards
                    if remote.latest >= state.agreed.latest {
                        state.agreed = remote;
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(?err, "failed reading consensus tuple"),
            }
        }
    }

    pub(crate) fn recompute(&self, state: &mut ConsensusState) {
        let now = Instant::now();
        let max_age = self.config.max_update_threshold();

        // a stale view means the backend has not polled successfully in too long
        for view in state.views.values_mut() {
            if view.last_update.is_some() && !view.is_fresh(now, max_age) && !view.is_banned(now) {
                debug!("backend went stale. banning");
                view.banned_until = Some(now + self.config.ban_period());
            }
        }

        let candidates: Vec<&BackendView> = state
            .views
            .values()
            .filter(|v| !v.is_banned(now) && v.is_fresh(now, max_age))
            .collect();

        if candidates.is_empty() {
            return;
        }

        let quorum = quorum_size(candidates.len(), self.config.quorum_fraction);

        let latest = quorum_agreed(candidates.iter().filter_map(|v| v.latest).collect(), quorum);
        let mut safe = quorum_agreed(candidates.iter().filter_map(|v| v.safe).collect(), quorum);
        let mut finalized = quorum_agreed(
            candidates.iter().filter_map(|v| v.finalized).collect(),
            quorum,
        );

        // a forced candidate's safe/finalized view wins over the quorum's
        for backend in &self.backends {
            if !backend.forced_candidate {
                continue;
            }

            if let Some(view) = state.views.get(&backend.name) {
                if view.is_banned(now) || !view.is_fresh(now, max_age) {
                    continue;
                }

                if view.safe.is_some() {
                    safe = view.safe;
                }
                if view.finalized.is_some() {
                    finalized = view.finalized;
                }
            }
        }

        let latest = match (latest, state.agreed.latest) {
            // exposed latest is monotone for the life of this poller
            (Some(new), Some(old)) => Some(new.max(old)),
            (new, old) => new.or(old),
        };

        // safe and finalized never exceed the group's latest
        if let Some(latest) = latest {
            safe = safe.map(|x| x.min(latest));
            finalized = finalized.map(|x| x.min(latest));
        }

        state.agreed = BlockNumbers {
            latest,
            safe,
            finalized,
        };

        // group-relative divergence bans
        let agreed = state.agreed;
        let ban_until = now + self.config.ban_period();

        for (name, view) in state.views.iter_mut() {
            if view.is_banned(now) || view.last_update.is_none() {
                continue;
            }

            if let (Some(agreed_latest), Some(latest)) = (agreed.latest, view.latest) {
                if agreed_latest.as_u64().saturating_sub(latest.as_u64()) > self.config.max_block_lag {
                    warn!(backend=%name, %latest, %agreed_latest, "lagging the group. banning");
                    view.banned_until = Some(ban_until);
                    continue;
                }
            }

            let backend = self.backends.iter().find(|b| &b.name == name);

            let safe_drift = backend
                .and_then(|b| b.max_safe_block_drift)
                .unwrap_or(self.config.max_safe_block_drift);
            let finalized_drift = backend
                .and_then(|b| b.max_finalized_block_drift)
                .unwrap_or(self.config.max_finalized_block_drift);

            if let (Some(agreed_safe), Some(safe)) = (agreed.safe, view.safe) {
                if agreed_safe.as_u64().saturating_sub(safe.as_u64()) > safe_drift {
                    warn!(backend=%name, %safe, %agreed_safe, "safe block drifted. banning");
                    view.banned_until = Some(ban_until);
                    continue;
                }
            }

            if let (Some(agreed_finalized), Some(finalized)) = (agreed.finalized, view.finalized) {
                if agreed_finalized.as_u64().saturating_sub(finalized.as_u64()) > finalized_drift {
                    warn!(backend=%name, %finalized, %agreed_finalized, "finalized block drifted. banning");
                    view.banned_until = Some(ban_until);
                }
            }
        }
    }

    pub fn block_numbers(&self) -> BlockNumbers {
        self.state.read().agreed
    }

    pub fn get_latest_block_number(&self) -> Option<U64> {
        self.state.read().agreed.latest
    }

    pub fn get_safe_block_number(&self) -> Option<U64> {
        self.state.read().agreed.safe
    }

    pub fn get_finalized_block_number(&self) -> Option<U64> {
        self.state.read().agreed.finalized
    }

    /// the backends currently eligible for consensus-aware routing
    pub fn get_consensus_group(&self) -> Vec<Arc<Web3Backend>> {
        let now = Instant::now();
        let max_age = self.config.max_update_threshold();

        let state = self.state.read();

        self.backends
            .iter()
            .filter(|backend| match state.views.get(&backend.name) {
                Some(view) => !view.is_banned(now) && view.is_fresh(now, max_age),
                None => false,
            })
            .cloned()
            .collect()
    }
}

/// how many candidates must see a height before we expose it
fn quorum_size(candidates: usize, fraction: f64) -> usize {
    let quorum = (candidates as f64 * fraction).floor() as usize + 1;

    quorum.clamp(1, candidates)
}

/// the highest height that at least `quorum` candidates have reached.
/// equivalently: the lowest height within the top-quorum subset
fn quorum_agreed(mut heights: Vec<U64>, quorum: usize) -> Option<U64> {
    if heights.len() < quorum {
        return None;
    }

    heights.sort_unstable_by(|a, b| b.cmp(a));

    heights.get(quorum - 1).copied()
}

fn hex_result(res: &crate::jsonrpc::JsonRpcForwardedResponse) -> Option<U64> {
    match &res.result {
        Some(serde_json::Value::String(s)) => s
            .strip_prefix("0x")
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .map(U64::from),
        _ => None,
    }
}

fn block_number_result(res: &crate::jsonrpc::JsonRpcForwardedResponse) -> Option<U64> {
    match &res.result {
        Some(serde_json::Value::Object(obj)) => match obj.get("number") {
            Some(serde_json::Value::String(s)) => s
                .strip_prefix("0x")
                .and_then(|s| u64::from_str_radix(s, 16).ok())
                .map(U64::from),
            _ => None,
        },
        _ => None,
    }
}

/// Coordinates the agreed tuple across proxy replicas. Only the leader may
/// write; everyone may read.
#[async_trait]
pub trait ConsensusTracker: Send + Sync {
    fn is_leader(&self) -> bool;

    async fn publish(&self, nums: &BlockNumbers) -> anyhow::Result<()>;

    async fn read(&self) -> anyhow::Result<Option<BlockNumbers>>;
}

/// Single-replica deployments have nothing to coordinate.
pub struct LocalTracker;

#[async_trait]
impl ConsensusTracker for LocalTracker {
    fn is_leader(&self) -> bool {
        true
    }

    async fn publish(&self, _nums: &BlockNumbers) -> anyhow::Result<()> {
        Ok(())
    }

    async fn read(&self) -> anyhow::Result<Option<BlockNumbers>> {
        Ok(None)
    }
}

/// Leader election through a redis lease. Whoever holds the lease writes the
/// tuple; losing the lease flips the poller to read-only.
pub struct RedisTracker {
    pool: RedisPool,
    node_id: String,
    lease_key: String,
    tuple_key: String,
    config: HaConfig,
    leader: AtomicBool,
}

impl RedisTracker {
    pub fn new(pool: RedisPool, group: &str, config: HaConfig) -> Arc<Self> {
        let mut rng = WyRand::new();
        let node_id = format!("{:016x}", rng.generate::<u64>());

        Arc::new(Self {
            pool,
            node_id,
            lease_key: format!("web3_gateway:ha:{}:leader", group),
            tuple_key: format!("web3_gateway:ha:{}:tuple", group),
            config,
            leader: AtomicBool::new(false),
        })
    }

    pub fn spawn_renewal(self: &Arc<Self>) -> AnyhowJoinHandle<()> {
        let tracker = self.clone();

        tokio::spawn(async move {
            loop {
                if let Err(err) = tracker.renew_lease().await {
                    debug!(?err, "lease renewal failed");
                    tracker.leader.store(false, Ordering::Release);
                }

                sleep(Duration::from_secs(tracker.config.lock_period_seconds)).await;
            }
        })
    }

    async fn renew_lease(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await.context("lease connection")?;

        let lease_ms = self.config.lease_duration_seconds * 1_000;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.lease_key)
            .arg(&self.node_id)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .context("acquire lease")?;

        if acquired.is_some() {
            if !self.leader.swap(true, Ordering::AcqRel) {
                warn!(node=%self.node_id, "took consensus leadership");
            }
            return Ok(());
        }

        // not free. it might already be ours
        let holder: Option<String> = redis::cmd("GET")
            .arg(&self.lease_key)
            .query_async(&mut conn)
            .await
            .context("read lease")?;

        if holder.as_deref() == Some(self.node_id.as_str()) {
            redis::cmd("PEXPIRE")
                .arg(&self.lease_key)
                .arg(lease_ms)
                .query_async::<_, ()>(&mut conn)
                .await
                .context("extend lease")?;

            self.leader.store(true, Ordering::Release);
        } else if self.leader.swap(false, Ordering::AcqRel) {
            warn!(node=%self.node_id, ?holder, "lost consensus leadership");
        }

        Ok(())
    }
}

#[async_trait]
impl ConsensusTracker for RedisTracker {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    async fn publish(&self, nums: &BlockNumbers) -> anyhow::Result<()> {
        if !self.is_leader() {
            return Ok(());
        }

        let mut conn = self.pool.get().await.context("tuple connection")?;

        let value = serde_json::to_string(nums).context("serialize tuple")?;

        redis::cmd("SET")
            .arg(&self.tuple_key)
            .arg(value)
            .arg("PX")
            .arg(self.config.lease_duration_seconds * 1_000)
            .query_async::<_, ()>(&mut conn)
            .await
            .context("write tuple")?;

        Ok(())
    }

    async fn read(&self) -> anyhow::Result<Option<BlockNumbers>> {
        let mut conn = self.pool.get().await.context("tuple connection")?;

        let value: Option<String> = redis::cmd("GET")
            .arg(&self.tuple_key)
            .query_async(&mut conn)
            .await
            .context("read tuple")?;

        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).context("parse tuple")?)),
            None => Ok(None),
        }
    }
}
