use argh::FromArgs;
use hashbrown::HashMap;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, FromArgs)]
/// web3_gateway is a consensus-aware routing and caching proxy for Ethereum JsonRPC servers.
pub struct CliConfig {
    /// what port the proxy should listen on
    #[argh(option, default = "8545")]
    pub port: u16,

    /// number of worker threads. Defaults to the number of logical processors
    #[argh(option, default = "0")]
    pub workers: usize,

    /// path to a toml of backends and backend groups
    #[argh(option, default = "\"./config/development.toml\".to_string()")]
    pub config: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopConfig {
    pub app: AppConfig,
    pub backends: HashMap<String, BackendConfig>,
    pub backend_groups: HashMap<String, BackendGroupConfig>,
    /// rpc method name -> backend group name. unmapped methods are rejected
    pub rpc_method_mappings: HashMap<String, String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sender_rate_limit: SenderRateLimitConfig,
    #[serde(default)]
    pub tx_validation: TxValidationConfig,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// maximum size of a client request body, in bytes
    #[serde(default = "default_max_body_size_bytes")]
    pub max_body_size_bytes: usize,

    /// maximum number of requests in one client batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// client batches are re-chunked to at most this many requests per upstream call.
    /// 0 forwards whole buckets unchanged
    #[serde(default = "default_max_upstream_batch_size")]
    pub max_upstream_batch_size: usize,

    /// overall deadline for a client request, in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// which header carries the client ip
    #[serde(default = "default_ip_header")]
    pub ip_header: String,

    /// the address this proxy appends to X-Forwarded-For
    #[serde(default = "default_proxy_ip")]
    pub proxy_ip: String,

    /// annotate responses with the backend that served them
    #[serde(default)]
    pub enable_served_by_header: bool,

    /// url of a volatile redis. shared by the remote cache, remote rate
    /// limiters, and the consensus tracker
    pub redis_url: Option<String>,

    #[serde(default)]
    pub redis_max_connections: Option<usize>,

    /// path aliases that are allowed to authenticate. empty allows anonymous "/"
    #[serde(default)]
    pub authenticated_paths: Vec<String>,

    /// group used for websocket connections
    pub ws_backend_group: Option<String>,

    /// methods allowed over websockets. None allows everything the mappings allow
    pub ws_method_whitelist: Option<Vec<String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl AppConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_max_body_size_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_upstream_batch_size() -> usize {
    10
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_ip_header() -> String {
    "X-Forwarded-For".to_string()
}

fn default_proxy_ip() -> String {
    "127.0.0.1".to_string()
}

/// One upstream execution node.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub rpc_url: String,
    pub ws_url: Option<String>,
    /// every forwarded request is mirrored here, fire-and-forget
    pub ingress_url: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,
    /// static headers sent with every upstream request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// keep only the first hop of X-Forwarded-For instead of appending our ip
    #[serde(default)]
    pub strip_trailing_xff: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backend_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_response_size_bytes")]
    pub max_response_size_bytes: u64,
    /// bound on concurrent in-flight requests. 0 is unlimited
    #[serde(default)]
    pub max_rps: u32,
    /// bound on concurrent websocket connections. 0 is unlimited
    #[serde(default)]
    pub max_ws_conns: u32,
    /// non-200 statuses that still carry a valid json-rpc body
    #[serde(default)]
    pub allowed_response_codes: Vec<u16>,

    #[serde(default)]
    pub tls_insecure_skip_verify: bool,

    /// relative share of traffic under weighted routing
    #[serde(default = "default_weight")]
    pub weight: u32,

    // health thresholds
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_threshold_ms: u64,
    #[serde(default = "default_max_degraded_latency_ms")]
    pub max_degraded_latency_threshold_ms: u64,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate_threshold: f64,

    // consensus knobs
    #[serde(default)]
    pub consensus_skip_peer_count_check: bool,
    #[serde(default)]
    pub consensus_skip_syncing_check: bool,
    #[serde(default)]
    pub consensus_forced_candidate: bool,
    /// how far this backend's safe block may trail the group's. None uses the group default
    pub consensus_max_safe_block_drift: Option<u64>,
    pub consensus_max_finalized_block_drift: Option<u64>,
    /// dialect used when translating consensus_getReceipts
    #[serde(default)]
    pub consensus_receipts_target: ReceiptsTarget,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backend_timeout_seconds() -> u64 {
    5
}

fn default_max_response_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_weight() -> u32 {
    1
}

fn default_max_latency_ms() -> u64 {
    2_000
}

fn default_max_degraded_latency_ms() -> u64 {
    500
}

fn default_max_error_rate() -> f64 {
    0.5
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptsTarget {
    #[default]
    DebugGetRawReceipts,
    EthGetBlockReceipts,
    ParityGetBlockReceipts,
    AlchemyGetTransactionReceipts,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    Fallback,
    Multicall,
    ConsensusAware,
}

#[derive(Debug, Deserialize)]
pub struct BackendGroupConfig {
    pub backends: Vec<String>,
    /// last-resort members. must also appear in `backends`
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub routing: RoutingStrategy,
    #[serde(default)]
    pub weighted_routing: bool,
    /// largest eth_getLogs / eth_newFilter span. 0 is unlimited
    #[serde(default)]
    pub max_block_range: u64,
    pub consensus: Option<ConsensusConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_ban_period_seconds")]
    pub ban_period_seconds: u64,
    /// a backend that has not polled successfully in this long is dropped
    #[serde(default = "default_max_update_threshold_seconds")]
    pub max_update_threshold_seconds: u64,
    #[serde(default = "default_max_block_lag")]
    pub max_block_lag: u64,
    #[serde(default = "default_min_peer_count")]
    pub min_peer_count: u64,
    #[serde(default = "default_max_safe_block_drift")]
    pub max_safe_block_drift: u64,
    #[serde(default = "default_max_finalized_block_drift")]
    pub max_finalized_block_drift: u64,
    /// share of candidates that must agree on a height before it is exposed.
    /// 0.5 is a strict majority. 0.0 trusts the highest candidate
    #[serde(default = "default_quorum_fraction")]
    pub quorum_fraction: f64,
    /// coordinate the agreed tuple across proxy replicas
    pub ha: Option<HaConfig>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl ConsensusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn ban_period(&self) -> Duration {
        Duration::from_secs(self.ban_period_seconds)
    }

    pub fn max_update_threshold(&self) -> Duration {
        Duration::from_secs(self.max_update_threshold_seconds)
    }
}

fn default_poll_interval_seconds() -> u64 {
    1
}

fn default_ban_period_seconds() -> u64 {
    300
}

fn default_max_update_threshold_seconds() -> u64 {
    30
}

fn default_max_block_lag() -> u64 {
    8
}

fn default_min_peer_count() -> u64 {
    3
}

fn default_max_safe_block_drift() -> u64 {
    2 * 32
}

fn default_max_finalized_block_drift() -> u64 {
    3 * 32
}

fn default_quorum_fraction() -> f64 {
    0.5
}

#[derive(Clone, Debug, Deserialize)]
pub struct HaConfig {
    /// how often the leader renews its lease, in seconds
    #[serde(default = "default_lock_period_seconds")]
    pub lock_period_seconds: u64,
    /// how long a lease lasts without renewal, in seconds
    #[serde(default = "default_lease_duration_seconds")]
    pub lease_duration_seconds: u64,
}

fn default_lock_period_seconds() -> u64 {
    5
}

fn default_lease_duration_seconds() -> u64 {
    15
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    Redis,
    /// redis first, memory when redis is down
    RedisWithMemoryFallback,
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_max_items")]
    pub max_items: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

fn default_cache_ttl_seconds() -> u64 {
    12 * 60 * 60
}

fn default_cache_max_items() -> u64 {
    100_000
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    /// requests allowed per interval per client ip. 0 disables the base limit
    #[serde(default)]
    pub base_rate: u64,
    #[serde(default = "default_rate_interval_seconds")]
    pub base_interval_seconds: u64,
    #[serde(default)]
    pub storage: StorageKind,
    /// per-method limits, keyed by method name
    #[serde(default)]
    pub method_overrides: HashMap<String, MethodOverride>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MethodOverride {
    pub limit: u64,
    #[serde(default = "default_rate_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_rate_interval_seconds() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct SenderRateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sender_limit")]
    pub limit: u64,
    #[serde(default = "default_sender_interval_seconds")]
    pub interval_seconds: u64,
    /// transactions for other chains are rejected before they consume quota
    #[serde(default)]
    pub allowed_chain_ids: Vec<u64>,
}

impl Default for SenderRateLimitConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

fn default_sender_limit() -> u64 {
    1
}

fn default_sender_interval_seconds() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct TxValidationConfig {
    /// opaque middleware that vets raw transactions before they are forwarded
    pub url: Option<String>,
    /// when the middleware itself errors, let the transaction through
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default = "default_tx_validation_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TxValidationConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

fn default_fail_open() -> bool {
    true
}

fn default_tx_validation_timeout_seconds() -> u64 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let toml = r#"
            [app]
            redis_url = "redis://localhost:6379"

            [backends.infura]
            rpc_url = "https://mainnet.example.com"
            max_rps = 50

            [backends.local-geth]
            rpc_url = "http://127.0.0.1:8545"
            ws_url = "ws://127.0.0.1:8546"
            consensus_receipts_target = "eth_get_block_receipts"

            [backend_groups.main]
            backends = ["infura", "local-geth"]
            fallbacks = ["local-geth"]
            routing = "consensus_aware"
            max_block_range = 1000

            [backend_groups.main.consensus]
            poll_interval_seconds = 2

            [rpc_method_mappings]
            eth_chainId = "main"
            eth_getLogs = "main"

            [rate_limit]
            base_rate = 100

            [rate_limit.method_overrides.eth_getLogs]
            limit = 10
            interval_seconds = 2
        "#;

        let config: TopConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.app.max_batch_size, 100);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(
            config.backends["local-geth"].consensus_receipts_target,
            ReceiptsTarget::EthGetBlockReceipts
        );

        let group = &config.backend_groups["main"];
        assert_eq!(group.routing, RoutingStrategy::ConsensusAware);
        assert_eq!(group.max_block_range, 1000);

        let consensus = group.consensus.as_ref().unwrap();
        assert_eq!(consensus.poll_interval_seconds, 2);
        assert_eq!(consensus.max_block_lag, 8);

        assert_eq!(config.rate_limit.method_overrides["eth_getLogs"].limit, 10);
        assert!(!config.sender_rate_limit.enabled);
    }
}
