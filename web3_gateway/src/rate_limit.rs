//! Rolling-window rate limiting for the frontend and for transaction senders.

use crate::errors::{Web3GatewayError, Web3GatewayResult};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, U256, U64};
use ethers::utils::rlp::Rlp;
use hashbrown::HashMap;
use parking_lot::Mutex;
use redis_rate_limiter::{RedisRateLimitResult, RedisRateLimiter};
use tokio::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug)]
pub enum RateLimitResult {
    Allowed,
    /// over the limit until the window rolls
    RetryAt(Instant),
    /// the limit is zero. retrying will not help
    RetryNever,
}

#[derive(Debug)]
struct MemoryBuckets {
    period_id: u64,
    counts: HashMap<String, u64>,
}

/// Counts events per key in the current truncated-timestamp window.
/// The whole window resets when the truncated timestamp changes.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    max: u64,
    period: Duration,
    start: Instant,
    buckets: Mutex<MemoryBuckets>,
}

impl MemoryRateLimiter {
    pub fn new(max: u64, period: Duration) -> Self {
        Self {
            max,
            period,
            start: Instant::now(),
            buckets: Mutex::new(MemoryBuckets {
                period_id: 0,
                counts: HashMap::new(),
            }),
        }
    }

    pub fn take(&self, key: &str, amount: u64) -> RateLimitResult {
        if self.max == 0 {
            return RateLimitResult::RetryNever;
        }

        let elapsed = self.start.elapsed();
        let period_id = (elapsed.as_secs_f64() / self.period.as_secs_f64()) as u64;

        let mut buckets = self.buckets.lock();

        if buckets.period_id != period_id {
            buckets.period_id = period_id;
            buckets.counts.clear();
        }

        let count = buckets.counts.entry(key.to_string()).or_insert(0);
        *count += amount;

        if *count > self.max {
            let retry_at = self.start + self.period * (period_id as u32 + 1);

            RateLimitResult::RetryAt(retry_at)
        } else {
            RateLimitResult::Allowed
        }
    }
}

fn convert_redis(result: RedisRateLimitResult) -> RateLimitResult {
    match result {
        RedisRateLimitResult::Allowed(_) => RateLimitResult::Allowed,
        RedisRateLimitResult::RetryAt(at, _) => RateLimitResult::RetryAt(at),
        RedisRateLimitResult::RetryNever => RateLimitResult::RetryNever,
    }
}

/// The counter behind a rate limit. Remote when we need agreement across
/// proxy replicas, local when we don't or when redis is down.
pub enum FrontendRateLimiter {
    Memory(MemoryRateLimiter),
    Redis(RedisRateLimiter),
    RedisWithMemoryFallback(RedisRateLimiter, MemoryRateLimiter),
}

impl FrontendRateLimiter {
    pub async fn take(&self, key: &str, amount: u64) -> Web3GatewayResult<RateLimitResult> {
        match self {
            Self::Memory(limiter) => Ok(limiter.take(key, amount)),
            Self::Redis(limiter) => {
                let x = limiter
                    .throttle_label(key, None, amount)
                    .await
                    .map_err(Web3GatewayError::Anyhow)?;

                Ok(convert_redis(x))
            }
            Self::RedisWithMemoryFallback(primary, secondary) => {
                match primary.throttle_label(key, None, amount).await {
                    Ok(x) => Ok(convert_redis(x)),
                    Err(err) => {
                        warn!(?err, "rate limit primary failed. using local counter");
                        Ok(secondary.take(key, amount))
                    }
                }
            }
        }
    }
}

/// What we learned from a raw transaction without executing it.
#[derive(Debug)]
pub struct RecoveredTx {
    pub sender: Address,
    pub nonce: U256,
    pub chain_id: Option<U64>,
}

/// Decode a signed raw transaction and recover its signer.
pub fn decode_raw_tx(raw: &str) -> Web3GatewayResult<RecoveredTx> {
    let bytes: Bytes = raw
        .parse()
        .map_err(|_| Web3GatewayError::InvalidSender("transaction is not valid hex".into()))?;

    let rlp = Rlp::new(bytes.as_ref());

    let (tx, sig) = TypedTransaction::decode_signed(&rlp)
        .map_err(|_| Web3GatewayError::InvalidSender("could not decode transaction".into()))?;

    let sender = sig
        .recover(tx.sighash())
        .map_err(|_| Web3GatewayError::InvalidSender("could not recover signer".into()))?;

    let nonce = tx
        .nonce()
        .copied()
        .ok_or(Web3GatewayError::InvalidSender("missing nonce".into()))?;

    Ok(RecoveredTx {
        sender,
        nonce,
        chain_id: tx.chain_id(),
    })
}

/// Limits how often one (sender, nonce) pair may be submitted.
pub struct SenderRateLimiter {
    allowed_chain_ids: Vec<u64>,
    limiter: FrontendRateLimiter,
}

impl SenderRateLimiter {
    pub fn new(allowed_chain_ids: Vec<u64>, limiter: FrontendRateLimiter) -> Self {
        Self {
            allowed_chain_ids,
            limiter,
        }
    }

    /// the chain-id allowlist is enforced before any quota is consumed
    pub async fn check_raw_tx(&self, raw: &str) -> Web3GatewayResult<()> {
        let recovered = decode_raw_tx(raw)?;

        let chain_id = recovered
            .chain_id
            .ok_or(Web3GatewayError::InvalidSender("missing chain id".into()))?;

        if !self.allowed_chain_ids.is_empty()
            && !self.allowed_chain_ids.contains(&chain_id.as_u64())
        {
            return Err(Web3GatewayError::InvalidSender(
                format!("chain id {} is not allowed", chain_id).into(),
            ));
        }

        let key = format!("{:?}:{}", recovered.sender, recovered.nonce);

        match self.limiter.take(&key, 1).await? {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::RetryAt(_) | RateLimitResult::RetryNever => {
                Err(Web3GatewayError::OverSenderRateLimit)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::TransactionRequest;

    fn signed_raw_tx(wallet: &LocalWallet, nonce: u64, chain_id: u64) -> String {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(Address::zero())
            .value(1u64)
            .nonce(nonce)
            .gas(21_000u64)
            .gas_price(1_000_000_000u64)
            .chain_id(chain_id)
            .into();

        let sig = wallet.sign_transaction_sync(&tx).unwrap();

        format!("0x{}", ethers::utils::hex::encode(tx.rlp_signed(&sig)))
    }

    #[tokio::test(start_paused = true)]
    async fn memory_limiter_allows_then_blocks_then_resets() {
        let limiter = MemoryRateLimiter::new(3, Duration::from_secs(10));

        for _ in 0..3 {
            assert!(matches!(limiter.take("k", 1), RateLimitResult::Allowed));
        }

        // the (max+1)-th call is refused
        assert!(matches!(limiter.take("k", 1), RateLimitResult::RetryAt(_)));

        // other keys are unaffected
        assert!(matches!(limiter.take("other", 1), RateLimitResult::Allowed));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(matches!(limiter.take("k", 1), RateLimitResult::Allowed));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_never_allows() {
        let limiter = MemoryRateLimiter::new(0, Duration::from_secs(1));

        assert!(matches!(limiter.take("k", 1), RateLimitResult::RetryNever));
    }

    #[tokio::test]
    async fn sender_recovery_round_trips() {
        let wallet: LocalWallet =
            "0000000000000000000000000000000000000000000000000000000000000001"
                .parse()
                .unwrap();

        let raw = signed_raw_tx(&wallet, 5, 1);

        let recovered = decode_raw_tx(&raw).unwrap();

        assert_eq!(recovered.sender, wallet.address());
        assert_eq!(recovered.nonce, U256::from(5));
        assert_eq!(recovered.chain_id, Some(U64::from(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn sender_limit_applies_per_nonce() {
        let wallet: LocalWallet =
            "0000000000000000000000000000000000000000000000000000000000000002"
                .parse()
                .unwrap();

        let limiter = SenderRateLimiter::new(
            vec![1],
            FrontendRateLimiter::Memory(MemoryRateLimiter::new(1, Duration::from_secs(10))),
        );

        let raw = signed_raw_tx(&wallet, 5, 1);

        limiter.check_raw_tx(&raw).await.unwrap();

        // the same (sender, nonce) again is over the limit
        assert!(matches!(
            limiter.check_raw_tx(&raw).await,
            Err(Web3GatewayError::OverSenderRateLimit)
        ));

        // a different nonce has its own bucket
        let raw = signed_raw_tx(&wallet, 6, 1);
        limiter.check_raw_tx(&raw).await.unwrap();
    }

    #[tokio::test]
    async fn disallowed_chain_id_does_not_consume_quota() {
        let wallet: LocalWallet =
            "0000000000000000000000000000000000000000000000000000000000000003"
                .parse()
                .unwrap();

        let limiter = SenderRateLimiter::new(
            vec![1],
            FrontendRateLimiter::Memory(MemoryRateLimiter::new(1, Duration::from_secs(10))),
        );

        let wrong_chain = signed_raw_tx(&wallet, 5, 2);

        assert!(matches!(
            limiter.check_raw_tx(&wrong_chain).await,
            Err(Web3GatewayError::InvalidSender(_))
        ));

        // quota is still available for the allowed chain
        let raw = signed_raw_tx(&wallet, 5, 1);
        limiter.check_raw_tx(&raw).await.unwrap();
    }
}
