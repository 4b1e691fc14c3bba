//! A counter of events in a rolling time period, backed by Redis.

use anyhow::Context;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{Duration, Instant};
use tracing::trace;

pub use deadpool_redis::redis;
pub use deadpool_redis::{
    Config as RedisConfig, Connection as RedisConnection, Pool as RedisPool,
    PoolError as RedisPoolError, Runtime as DeadpoolRuntime,
};

#[derive(Clone)]
pub struct RedisRateLimiter {
    key_prefix: String,
    /// the default maximum requests allowed in a period
    pub max_requests_per_period: u64,
    /// seconds
    pub period: f32,
    pool: RedisPool,
}

pub enum RedisRateLimitResult {
    /// carries the count already used in this period
    Allowed(u64),
    /// Retry at the given instant
    RetryAt(Instant, u64),
    /// Retrying will never succeed
    RetryNever,
}

impl RedisRateLimiter {
    pub fn new(
        app: &str,
        label: &str,
        max_requests_per_period: u64,
        period: f32,
        pool: RedisPool,
    ) -> Self {
        let key_prefix = format!("{}:rrl:{}", app, label);

        Self {
            key_prefix,
            max_requests_per_period,
            period,
            pool,
        }
    }

    pub fn now_as_secs(&self) -> f32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("cannot tell the time")
            .as_secs_f32()
    }

    pub fn period_id(&self, now_as_secs: f32) -> f32 {
        (now_as_secs / self.period).floor()
    }

    pub fn next_period(&self, now_as_secs: f32) -> f32 {
        (now_as_secs / self.period).floor() * self.period + self.period
    }

    /// count an event under the given label, failing closed past the max.
    pub async fn throttle_label(
        &self,
        label: &str,
        max_per_period: Option<u64>,
        count: u64,
    ) -> anyhow::Result<RedisRateLimitResult> {
        let max_per_period = max_per_period.unwrap_or(self.max_requests_per_period);

        if max_per_period == 0 {
            return Ok(RedisRateLimitResult::RetryNever);
        }

        let now = self.now_as_secs();

        // keys include the truncated period so they roll over and expire on their own
        let throttle_key = format!("{}:{}:{}", self.key_prefix, label, self.period_id(now));

        let mut conn = self
            .pool
            .get()
            .await
            .context("get redis connection for rate limit")?;

        // a pipeline so count and expiration land in a single round trip
        let x: Vec<u64> = redis::pipe()
            .atomic()
            .incr(&throttle_key, count)
            .expire(&throttle_key, self.period.ceil() as usize)
            .ignore()
            .query_async(&mut conn)
            .await
            .context("increment rate limit")?;

        let new_count = *x.first().context("check rate limit result")?;

        if new_count > max_per_period {
            let retry_at = Instant::now()
                + Duration::from_secs_f32((self.next_period(now) - now).max(0.0));

            trace!(%label, new_count, max_per_period, "rate limited");

            Ok(RedisRateLimitResult::RetryAt(retry_at, new_count))
        } else {
            Ok(RedisRateLimitResult::Allowed(new_count))
        }
    }

    #[inline]
    pub async fn throttle(&self) -> anyhow::Result<RedisRateLimitResult> {
        self.throttle_label("", None, 1).await
    }
}

/// Build a connection pool to the given redis server.
pub fn new_redis_pool(redis_url: &str, max_size: usize) -> anyhow::Result<RedisPool> {
    let config = RedisConfig::from_url(redis_url);

    let pool = config
        .builder()
        .context("build redis pool")?
        .max_size(max_size)
        .runtime(DeadpoolRuntime::Tokio1)
        .build()
        .context("build redis pool")?;

    Ok(pool)
}
