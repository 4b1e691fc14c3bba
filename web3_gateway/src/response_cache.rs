//! Cache immutable RPC results so repeat questions never reach a backend.

use crate::block_number::BlockNumbers;
use crate::jsonrpc::{JsonRpcForwardedResponse, JsonRpcRequest};
use crate::stats::ProxyMetrics;
use anyhow::Context;
use ethers::types::U64;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use redis_rate_limiter::redis::AsyncCommands;
use redis_rate_limiter::RedisPool;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{trace, warn};

/// Where cached values live.
pub enum CacheStorage {
    Memory(moka::future::Cache<String, Vec<u8>>),
    Redis { pool: RedisPool, ttl: Duration },
}

impl CacheStorage {
    pub fn new_memory(max_items: u64, ttl: Duration) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(max_items)
            .time_to_live(ttl)
            .build();

        Self::Memory(cache)
    }

    pub fn new_redis(pool: RedisPool, ttl: Duration) -> Self {
        Self::Redis { pool, ttl }
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self {
            Self::Memory(cache) => Ok(cache.get(key)),
            Self::Redis { pool, .. } => {
                let mut conn = pool.get().await.context("cache get connection")?;

                let value: Option<Vec<u8>> = conn.get(key).await.context("cache get")?;

                Ok(value)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        match self {
            Self::Memory(cache) => {
                cache.insert(key.to_string(), value).await;
                Ok(())
            }
            Self::Redis { pool, ttl } => {
                let mut conn = pool.get().await.context("cache set connection")?;

                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs() as usize)
                    .await
                    .context("cache set")?;

                Ok(())
            }
        }
    }
}

/// The response cache. Values are gzipped json results, never full envelopes,
/// so one entry can answer requests with different ids.
pub struct ResponseCache {
    primary: CacheStorage,
    fallback: Option<CacheStorage>,
    metrics: Arc<ProxyMetrics>,
}

impl ResponseCache {
    pub fn new(
        primary: CacheStorage,
        fallback: Option<CacheStorage>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            primary,
            fallback,
            metrics,
        }
    }

    pub async fn get(
        &self,
        req: &JsonRpcRequest,
        forwarded_headers: &[(String, String)],
        nums: &BlockNumbers,
    ) -> Option<JsonRpcForwardedResponse> {
        if !cacheable_request(req, nums) {
            return None;
        }

        let key = cache_key(req, forwarded_headers);

        let compressed = match self.storage_get(&key).await {
            Ok(Some(x)) => x,
            Ok(None) => return None,
            Err(err) => {
                warn!(?err, "cache get failed");
                self.metrics.cache_error();
                return None;
            }
        };

        let result: serde_json::Value = match decompress(&compressed)
            .and_then(|raw| serde_json::from_slice(&raw).context("cached value is not json"))
        {
            Ok(x) => x,
            Err(err) => {
                warn!(?err, %key, "discarding undecodable cache entry");
                self.metrics.cache_error();
                return None;
            }
        };

        trace!(%req.method, "cache hit");

        Some(JsonRpcForwardedResponse::from_value(result, req.id.clone()))
    }

    pub async fn put(
        &self,
        req: &JsonRpcRequest,
        res: &JsonRpcForwardedResponse,
        forwarded_headers: &[(String, String)],
        nums: &BlockNumbers,
    ) {
        if !cacheable_request(req, nums) || !cacheable_response(res) {
            return;
        }

        let result = res.result.as_ref().expect("checked by cacheable_response");

        let raw = match serde_json::to_vec(result) {
            Ok(x) => x,
            Err(err) => {
                warn!(?err, "response did not serialize");
                return;
            }
        };

        let key = cache_key(req, forwarded_headers);

        if let Err(err) = self.storage_set(&key, compress(&raw)).await {
            warn!(?err, "cache put failed");
            self.metrics.cache_error();
        }
    }

    async fn storage_get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.primary.get(key).await {
            Ok(x) => Ok(x),
            Err(err) => match &self.fallback {
                Some(fallback) => {
                    warn!(?err, "cache primary failed. trying fallback");
                    fallback.get(key).await
                }
                None => Err(err),
            },
        }
    }

    async fn storage_set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        match self.primary.set(key, value.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => match &self.fallback {
                Some(fallback) => {
                    warn!(?err, "cache primary failed. trying fallback");
                    fallback.set(key, value).await
                }
                None => Err(err),
            },
        }
    }
}

/// `cache:<method>:sha256(params || sorted forwarded headers)`
pub fn cache_key(req: &JsonRpcRequest, forwarded_headers: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();

    match &req.params {
        Some(params) => {
            hasher.update(serde_json::to_vec(params).expect("params are already valid json"))
        }
        None => hasher.update(b"null"),
    }

    let mut headers: Vec<_> = forwarded_headers.iter().collect();
    headers.sort();

    for (name, value) in headers {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
    }

    format!("cache:{}:{:x}", req.method, hasher.finalize())
}

/// can this request ever be served from cache?
fn cacheable_request(req: &JsonRpcRequest, nums: &BlockNumbers) -> bool {
    match req.method.as_str() {
        // chain identity never changes
        "eth_chainId" | "net_version" => true,
        // hash-addressed data is immutable
        "eth_getBlockByHash"
        | "eth_getBlockTransactionCountByHash"
        | "eth_getUncleCountByBlockHash"
        | "eth_getTransactionByBlockHashAndIndex"
        | "eth_getUncleByBlockHashAndIndex"
        | "eth_getRawTransactionByBlockHashAndIndex" => true,
        // number-addressed data is safe once the block cannot reorg
        "eth_getBlockByNumber"
        | "eth_getBlockTransactionCountByNumber"
        | "eth_getUncleCountByBlockNumber"
        | "eth_getTransactionByBlockNumberAndIndex"
        | "eth_getUncleByBlockNumberAndIndex"
        | "eth_getRawTransactionByBlockNumberAndIndex" => {
            block_at_or_before_finalized(req, 0, nums)
        }
        _ => false,
    }
}

fn block_at_or_before_finalized(req: &JsonRpcRequest, index: usize, nums: &BlockNumbers) -> bool {
    let finalized = match nums.finalized {
        Some(x) => x,
        None => return false,
    };

    let param = match &req.params {
        Some(serde_json::Value::Array(params)) => params.get(index),
        _ => None,
    };

    let hex = match param {
        Some(serde_json::Value::String(s)) => s,
        _ => return false,
    };

    // tags like "latest" and "pending" move. only settled numeric blocks cache
    match hex
        .strip_prefix("0x")
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .map(U64::from)
    {
        Some(num) => num <= finalized,
        None => false,
    }
}

fn cacheable_response(res: &JsonRpcForwardedResponse) -> bool {
    match &res.result {
        // a null result usually means "not found yet". don't pin that
        Some(serde_json::Value::Null) | None => false,
        Some(_) => !res.is_error(),
    }
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());

    encoder.write_all(data).expect("writing to a vec");

    encoder.finish().expect("writing to a vec")
}

fn decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);

    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("cached value did not decompress")?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::null_id;
    use serde_json::json;

    fn req(method: &str, params: serde_json::Value, id: u64) -> JsonRpcRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .unwrap()
    }

    fn memory_cache() -> ResponseCache {
        ResponseCache::new(
            CacheStorage::new_memory(100, Duration::from_secs(60)),
            None,
            Default::default(),
        )
    }

    fn finalized_nums() -> BlockNumbers {
        BlockNumbers {
            latest: Some(U64::from(0x64)),
            safe: Some(U64::from(0x50)),
            finalized: Some(U64::from(0x32)),
        }
    }

    #[tokio::test]
    async fn round_trip_rehydrates_with_the_readers_id() {
        let cache = memory_cache();
        let nums = finalized_nums();

        let first = req("eth_chainId", json!([]), 1);
        let res = JsonRpcForwardedResponse::from_value(json!("0x1"), first.id.clone());

        cache.put(&first, &res, &[], &nums).await;

        let second = req("eth_chainId", json!([]), 2);
        let cached = cache.get(&second, &[], &nums).await.unwrap();

        assert_eq!(cached.result, Some(json!("0x1")));
        assert_eq!(cached.id.get(), "2");
    }

    #[tokio::test]
    async fn uncacheable_methods_are_never_stored() {
        let cache = memory_cache();
        let nums = finalized_nums();

        let r = req("eth_blockNumber", json!([]), 1);
        let res = JsonRpcForwardedResponse::from_value(json!("0x64"), r.id.clone());

        cache.put(&r, &res, &[], &nums).await;

        assert!(cache.get(&r, &[], &nums).await.is_none());
    }

    #[tokio::test]
    async fn block_by_number_caches_only_finalized_blocks() {
        let cache = memory_cache();
        let nums = finalized_nums();

        // 0x32 is finalized
        let settled = req("eth_getBlockByNumber", json!(["0x32", false]), 1);
        let res = JsonRpcForwardedResponse::from_value(json!({"number": "0x32"}), settled.id.clone());
        cache.put(&settled, &res, &[], &nums).await;
        assert!(cache.get(&settled, &[], &nums).await.is_some());

        // 0x33 is past finalized and could still reorg
        let unsettled = req("eth_getBlockByNumber", json!(["0x33", false]), 1);
        let res =
            JsonRpcForwardedResponse::from_value(json!({"number": "0x33"}), unsettled.id.clone());
        cache.put(&unsettled, &res, &[], &nums).await;
        assert!(cache.get(&unsettled, &[], &nums).await.is_none());

        // symbolic tags never cache
        let tagged = req("eth_getBlockByNumber", json!(["latest", false]), 1);
        assert!(!cacheable_request(&tagged, &nums));
    }

    #[tokio::test]
    async fn error_and_null_responses_do_not_poison() {
        let cache = memory_cache();
        let nums = finalized_nums();

        let r = req("eth_chainId", json!([]), 1);

        let err = JsonRpcForwardedResponse::from_str("boom", Some(-32000), r.id.clone());
        cache.put(&r, &err, &[], &nums).await;
        assert!(cache.get(&r, &[], &nums).await.is_none());

        let null = JsonRpcForwardedResponse::from_value(json!(null), r.id.clone());
        cache.put(&r, &null, &[], &nums).await;
        assert!(cache.get(&r, &[], &nums).await.is_none());
    }

    #[test]
    fn forwarded_headers_split_the_key() {
        let r = req("eth_chainId", json!([]), 1);

        let bare = cache_key(&r, &[]);
        let signed = cache_key(
            &r,
            &[("x-optimism-signature".to_string(), "0xabc".to_string())],
        );

        assert_ne!(bare, signed);

        // header order does not matter
        let a = cache_key(
            &r,
            &[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
        );
        let b = cache_key(
            &r,
            &[
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ],
        );

        assert_eq!(a, b);
    }

    #[test]
    fn compression_round_trips() {
        let data = br#"{"number":"0x32","hash":"0xdead"}"#;

        let compressed = compress(data);

        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn null_id_is_valid_json() {
        assert_eq!(null_id().get(), "null");
    }
}
