//! Resolve symbolic block tags against the consensus view before a request
//! reaches a backend. Upstreams then see stable numeric blocks, which keeps
//! them cacheable and keeps a lagging backend from answering "latest" with
//! an old chain.

use crate::errors::Web3GatewayError;
use crate::jsonrpc::{JsonRpcForwardedResponse, JsonRpcRequest};
use ethers::types::U64;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The poller's current agreed view.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BlockNumbers {
    pub latest: Option<U64>,
    pub safe: Option<U64>,
    pub finalized: Option<U64>,
}

#[derive(Debug)]
pub enum RewriteResult {
    /// nothing to change
    None,
    /// the request was mutated in place
    OverrideRequest,
    /// no backend needed. the answer is already known
    OverrideResponse(JsonRpcForwardedResponse),
    /// the request can never succeed against this view
    OverrideError(Web3GatewayError),
}

/// positional index of the block tag per method. methods listed with `false`
/// may omit the parameter entirely
static BLOCK_PARAM_INDEX: Lazy<HashMap<&'static str, (usize, bool)>> = Lazy::new(|| {
    HashMap::from([
        ("eth_getBalance", (1, true)),
        ("eth_getCode", (1, true)),
        ("eth_getTransactionCount", (1, true)),
        ("eth_call", (1, false)),
        ("eth_estimateGas", (1, false)),
        ("eth_getStorageAt", (2, true)),
        ("eth_getBlockByNumber", (0, true)),
        ("eth_getBlockTransactionCountByNumber", (0, true)),
        ("eth_getUncleCountByBlockNumber", (0, true)),
        ("eth_getTransactionByBlockNumberAndIndex", (0, true)),
        ("eth_getUncleByBlockNumberAndIndex", (0, true)),
        ("eth_getProof", (2, true)),
        ("eth_feeHistory", (1, true)),
        ("eth_getBlockReceipts", (0, true)),
        ("debug_getRawReceipts", (0, true)),
        ("parity_getBlockReceipts", (0, true)),
        ("consensus_getReceipts", (0, true)),
    ])
});

pub fn hex_block(x: U64) -> String {
    format!("0x{:x}", x)
}

fn parse_hex_block(s: &str) -> Option<U64> {
    let stripped = s.strip_prefix("0x")?;

    u64::from_str_radix(stripped, 16).ok().map(U64::from)
}

enum Resolved {
    /// symbolic tag resolved to this block
    Rewritten(U64),
    /// already numeric and inside the known chain
    Unchanged(U64),
    /// not a block number at all (a hash, an object). leave it alone
    Opaque,
}

fn resolve_tag(value: &Value, nums: &BlockNumbers) -> Result<Resolved, Web3GatewayError> {
    let tag = match value {
        Value::String(s) => s.as_str(),
        // EIP-1898 objects and anything else pass through untouched
        _ => return Ok(Resolved::Opaque),
    };

    let latest = || {
        nums.latest
            .ok_or(Web3GatewayError::BlockOutOfRange("latest block not known".into()))
    };

    match tag {
        "latest" => Ok(Resolved::Rewritten(latest()?)),
        "pending" => Ok(Resolved::Rewritten(latest()? + U64::one())),
        "safe" => nums
            .safe
            .map(Resolved::Rewritten)
            .ok_or(Web3GatewayError::BlockOutOfRange("safe block not known".into())),
        "finalized" => nums
            .finalized
            .map(Resolved::Rewritten)
            .ok_or(Web3GatewayError::BlockOutOfRange(
                "finalized block not known".into(),
            )),
        "earliest" => Ok(Resolved::Rewritten(U64::zero())),
        other => match parse_hex_block(other) {
            Some(num) => {
                if num > latest()? {
                    Err(Web3GatewayError::BlockOutOfRange(
                        format!("block {} is beyond the chain head", num).into(),
                    ))
                } else {
                    Ok(Resolved::Unchanged(num))
                }
            }
            // probably a block hash
            None => Ok(Resolved::Opaque),
        },
    }
}

/// Rewrite the request in place. Already-numeric, in-range requests come back
/// `None`, so running the rewriter twice never changes anything.
pub fn rewrite_tags(
    req: &mut JsonRpcRequest,
    nums: &BlockNumbers,
    max_block_range: u64,
) -> RewriteResult {
    match req.method.as_str() {
        "eth_getLogs" | "eth_newFilter" => rewrite_range(req, nums, max_block_range),
        method => {
            let (index, required) = match BLOCK_PARAM_INDEX.get(method) {
                Some(x) => *x,
                None => return RewriteResult::None,
            };

            let params = match req.params.as_mut() {
                Some(Value::Array(params)) => params,
                _ => return RewriteResult::None,
            };

            let value = match params.get_mut(index) {
                Some(x) => x,
                None if !required => return RewriteResult::None,
                None => {
                    return RewriteResult::OverrideError(Web3GatewayError::InvalidParams(
                        "missing block parameter".into(),
                    ))
                }
            };

            match resolve_tag(value, nums) {
                Ok(Resolved::Rewritten(num)) => {
                    *value = Value::String(hex_block(num));
                    RewriteResult::OverrideRequest
                }
                Ok(Resolved::Unchanged(_)) | Ok(Resolved::Opaque) => RewriteResult::None,
                Err(err) => RewriteResult::OverrideError(err),
            }
        }
    }
}

fn rewrite_range(
    req: &mut JsonRpcRequest,
    nums: &BlockNumbers,
    max_block_range: u64,
) -> RewriteResult {
    let params = match req.params.as_mut() {
        Some(Value::Array(params)) => params,
        _ => return RewriteResult::None,
    };

    let obj = match params.get_mut(0) {
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            return RewriteResult::OverrideError(Web3GatewayError::InvalidParams(
                "filter must be an object".into(),
            ))
        }
        None => return RewriteResult::None,
    };

    // a blockHash filter pins the query already
    if obj.contains_key("blockHash") {
        return RewriteResult::None;
    }

    let mut changed = false;

    let resolve_bound = |value: Option<&Value>| -> Result<(U64, bool), Web3GatewayError> {
        // when only one bound is set, the other defaults to latest
        let value = value.cloned().unwrap_or_else(|| Value::String("latest".to_string()));

        match resolve_tag(&value, nums)? {
            Resolved::Rewritten(num) => Ok((num, true)),
            Resolved::Unchanged(num) => Ok((num, false)),
            Resolved::Opaque => Err(Web3GatewayError::InvalidParams(
                "invalid block in filter".into(),
            )),
        }
    };

    let (from, from_changed) = match resolve_bound(obj.get("fromBlock")) {
        Ok(x) => x,
        Err(err) => return RewriteResult::OverrideError(err),
    };
    let (to, to_changed) = match resolve_bound(obj.get("toBlock")) {
        Ok(x) => x,
        Err(err) => return RewriteResult::OverrideError(err),
    };

    if from > to {
        return RewriteResult::OverrideError(Web3GatewayError::InvalidParams(
            "fromBlock is after toBlock".into(),
        ));
    }

    if max_block_range > 0 && (to - from + U64::one()).as_u64() > max_block_range {
        return RewriteResult::OverrideError(Web3GatewayError::BlockRangeTooLarge {
            max: max_block_range,
        });
    }

    if from_changed || obj.get("fromBlock").is_none() {
        obj.insert("fromBlock".to_string(), Value::String(hex_block(from)));
        changed = true;
    }
    if to_changed || obj.get("toBlock").is_none() {
        obj.insert("toBlock".to_string(), Value::String(hex_block(to)));
        changed = true;
    }

    if changed {
        RewriteResult::OverrideRequest
    } else {
        RewriteResult::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nums() -> BlockNumbers {
        BlockNumbers {
            latest: Some(U64::from(0x64)),
            safe: Some(U64::from(0x50)),
            finalized: Some(U64::from(0x32)),
        }
    }

    fn req(method: &str, params: serde_json::Value) -> JsonRpcRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .unwrap()
    }

    #[test]
    fn latest_becomes_numeric() {
        let mut r = req("eth_getBalance", json!(["0xabc0000000000000000000000000000000000001", "latest"]));

        assert!(matches!(
            rewrite_tags(&mut r, &nums(), 0),
            RewriteResult::OverrideRequest
        ));

        assert_eq!(r.params.unwrap()[1], json!("0x64"));
    }

    #[test]
    fn pending_is_latest_plus_one() {
        let mut r = req("eth_getBlockByNumber", json!(["pending", false]));

        rewrite_tags(&mut r, &nums(), 0);

        assert_eq!(r.params.unwrap()[0], json!("0x65"));
    }

    #[test]
    fn safe_and_finalized_resolve() {
        let mut r = req("eth_getBlockByNumber", json!(["safe", false]));
        rewrite_tags(&mut r, &nums(), 0);
        assert_eq!(r.params.as_ref().unwrap()[0], json!("0x50"));

        let mut r = req("eth_getBlockByNumber", json!(["finalized", false]));
        rewrite_tags(&mut r, &nums(), 0);
        assert_eq!(r.params.as_ref().unwrap()[0], json!("0x32"));
    }

    #[test]
    fn unknown_tuple_member_is_an_error() {
        let empty = BlockNumbers::default();

        let mut r = req("eth_getBlockByNumber", json!(["latest", false]));

        assert!(matches!(
            rewrite_tags(&mut r, &empty, 0),
            RewriteResult::OverrideError(Web3GatewayError::BlockOutOfRange(_))
        ));
    }

    #[test]
    fn numeric_beyond_head_is_out_of_range() {
        let mut r = req("eth_getBlockByNumber", json!(["0x65", false]));

        assert!(matches!(
            rewrite_tags(&mut r, &nums(), 0),
            RewriteResult::OverrideError(Web3GatewayError::BlockOutOfRange(_))
        ));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let mut r = req("eth_getLogs", json!([{"fromBlock": "latest", "toBlock": "latest"}]));

        assert!(matches!(
            rewrite_tags(&mut r, &nums(), 10),
            RewriteResult::OverrideRequest
        ));

        let frozen = r.params.clone();

        // a second pass sees numeric bounds and leaves them alone
        assert!(matches!(rewrite_tags(&mut r, &nums(), 10), RewriteResult::None));
        assert_eq!(r.params, frozen);
    }

    #[test]
    fn get_logs_defaults_both_bounds_to_latest() {
        let mut r = req("eth_getLogs", json!([{"address": "0x00"}]));

        rewrite_tags(&mut r, &nums(), 10);

        let params = r.params.unwrap();
        assert_eq!(params[0]["fromBlock"], json!("0x64"));
        assert_eq!(params[0]["toBlock"], json!("0x64"));
    }

    #[test]
    fn oversized_range_names_the_limit() {
        let mut r = req("eth_getLogs", json!([{"fromBlock": "0x0", "toBlock": "0x64"}]));

        match rewrite_tags(&mut r, &nums(), 10) {
            RewriteResult::OverrideError(err) => {
                let (_, data) = err.as_response_parts();
                assert!(data.message.contains("block range greater than 10"));
            }
            other => panic!("expected an error, got {:?}", other),
        }
    }

    #[test]
    fn block_hash_filters_pass_through() {
        let mut r = req("eth_getLogs", json!([{"blockHash": "0xdead"}]));

        assert!(matches!(rewrite_tags(&mut r, &nums(), 10), RewriteResult::None));
    }

    #[test]
    fn unrelated_methods_pass_through() {
        let mut r = req("eth_chainId", json!([]));

        assert!(matches!(rewrite_tags(&mut r, &nums(), 10), RewriteResult::None));
    }
}
