mod common;

use common::{basic_config, MockRpc, TestApp};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tokio::time::{sleep, Duration, Instant};

#[test_log::test(tokio::test)]
async fn healthz_works() {
    let b1 = MockRpc::spawn().await;

    let app = TestApp::spawn(basic_config(
        &[("b1", &b1.url)],
        &[("eth_chainId", "main")],
    ))
    .await;

    let response = app
        .client
        .get(format!("{}/healthz", app.proxy_url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[test_log::test(tokio::test)]
async fn single_call_routes_to_the_first_healthy_backend() {
    let b1 = MockRpc::spawn().await;
    let b2 = MockRpc::spawn().await;

    let app = TestApp::spawn(basic_config(
        &[("b1", &b1.url), ("b2", &b2.url)],
        &[("eth_chainId", "main")],
    ))
    .await;

    let response = app
        .post(json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 7}))
        .await;

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("x-served-by").unwrap(),
        "main/b1"
    );

    let body: Value = response.json().await.unwrap();

    assert_eq!(body, json!({"jsonrpc": "2.0", "result": "0x1", "id": 7}));

    assert_eq!(b1.hits(), 1);
    assert_eq!(b2.hits(), 0);
}

#[test_log::test(tokio::test)]
async fn failover_moves_to_the_next_backend() {
    let b1 = MockRpc::spawn().await;
    let b2 = MockRpc::spawn().await;

    b1.state.fail_with_503.store(true, Ordering::Relaxed);

    let app = TestApp::spawn(basic_config(
        &[("b1", &b1.url), ("b2", &b2.url)],
        &[("eth_chainId", "main")],
    ))
    .await;

    let response = app
        .post(json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 1}))
        .await;

    assert_eq!(
        response.headers().get("x-served-by").unwrap(),
        "main/b2"
    );

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"], json!("0x1"));

    assert!(b1.hits() >= 1);
    assert_eq!(b2.hits(), 1);
}

#[test_log::test(tokio::test)]
async fn batches_preserve_order_even_with_duplicate_ids() {
    let b1 = MockRpc::spawn().await;

    let app = TestApp::spawn(basic_config(
        &[("b1", &b1.url)],
        &[("eth_chainId", "main"), ("eth_blockNumber", "main")],
    ))
    .await;

    let response = app
        .post(json!([
            {"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 1},
            {"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1},
        ]))
        .await;

    let body: Value = response.json().await.unwrap();

    let responses = body.as_array().unwrap();

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["result"], json!("0x1"));
    assert_eq!(responses[0]["id"], json!(1));
    assert_eq!(responses[1]["result"], json!("0x64"));
    assert_eq!(responses[1]["id"], json!(1));
}

#[test_log::test(tokio::test)]
async fn unmapped_methods_are_rejected_per_request() {
    let b1 = MockRpc::spawn().await;

    let app = TestApp::spawn(basic_config(
        &[("b1", &b1.url)],
        &[("eth_chainId", "main")],
    ))
    .await;

    let response = app
        .post(json!([
            {"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 1},
            {"jsonrpc": "2.0", "method": "eth_coinbase", "params": [], "id": 2},
        ]))
        .await;

    let body: Value = response.json().await.unwrap();
    let responses = body.as_array().unwrap();

    assert_eq!(responses[0]["result"], json!("0x1"));
    assert_eq!(responses[1]["error"]["code"], json!(-32001));
}

#[test_log::test(tokio::test)]
async fn eth_accounts_is_intercepted() {
    let b1 = MockRpc::spawn().await;

    let app = TestApp::spawn(basic_config(
        &[("b1", &b1.url)],
        &[("eth_chainId", "main")],
    ))
    .await;

    let response = app
        .post(json!({"jsonrpc": "2.0", "method": "eth_accounts", "params": [], "id": 3}))
        .await;

    let body: Value = response.json().await.unwrap();

    assert_eq!(body["result"], json!([]));
    assert_eq!(b1.hits(), 0);
}

#[test_log::test(tokio::test)]
async fn oversized_batches_are_refused() {
    let b1 = MockRpc::spawn().await;

    let mut config = basic_config(&[("b1", &b1.url)], &[("eth_chainId", "main")]);
    config.app.max_batch_size = 2;

    let app = TestApp::spawn(config).await;

    let batch: Vec<Value> = (0..3)
        .map(|i| json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": i}))
        .collect();

    let response = app.post(json!(batch)).await;

    let body: Value = response.json().await.unwrap();

    assert_eq!(body["error"]["code"], json!(-32014));
}

// tags are resolved against the consensus view and ranges are bounded
#[test_log::test(tokio::test)]
async fn consensus_group_rewrites_block_tags() {
    let b1 = MockRpc::spawn().await;

    let config = serde_json::from_value(json!({
        "app": { "enable_served_by_header": true },
        "backends": {
            "b1": {"rpc_url": b1.url.clone(), "max_retries": 0},
        },
        "backend_groups": {
            "main": {
                "backends": ["b1"],
                "routing": "consensus_aware",
                "max_block_range": 10,
                "consensus": {
                    "poll_interval_seconds": 1,
                    "min_peer_count": 1,
                },
            },
        },
        "rpc_method_mappings": {
            "eth_getLogs": "main",
        },
    }))
    .unwrap();

    let app = TestApp::spawn(config).await;

    // wait for the poller to agree on a head
    let start = Instant::now();
    loop {
        let response = app
            .post(json!({
                "jsonrpc": "2.0",
                "method": "eth_getLogs",
                "params": [{"fromBlock": "latest", "toBlock": "latest"}],
                "id": 1,
            }))
            .await;

        let body: Value = response.json().await.unwrap();

        if body["result"].is_array() {
            break;
        }

        if start.elapsed() > Duration::from_secs(10) {
            panic!("poller never agreed on a head block: {}", body);
        }

        sleep(Duration::from_millis(250)).await;
    }

    // the upstream saw numeric bounds, not tags
    let seen = b1.requests_for("eth_getLogs");
    let last = seen.last().unwrap();

    assert_eq!(last["params"][0]["fromBlock"], json!("0x64"));
    assert_eq!(last["params"][0]["toBlock"], json!("0x64"));

    // a 101-block range is over the group's limit of 10
    let response = app
        .post(json!({
            "jsonrpc": "2.0",
            "method": "eth_getLogs",
            "params": [{"fromBlock": "0x0", "toBlock": "0x64"}],
            "id": 2,
        }))
        .await;

    let body: Value = response.json().await.unwrap();

    let message = body["error"]["message"].as_str().unwrap();
    assert!(
        message.contains("block range greater than 10"),
        "unexpected message: {}",
        message
    );
}

// the second identical request is served from cache
#[test_log::test(tokio::test)]
async fn cache_serves_repeat_requests() {
    let b1 = MockRpc::spawn().await;

    let mut config = basic_config(&[("b1", &b1.url)], &[("eth_chainId", "main")]);
    config.cache.enabled = true;

    let app = TestApp::spawn(config).await;

    let request = json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 1});

    let response = app.post(request.clone()).await;
    assert_eq!(
        response.headers().get("X-Proxyd-Cache-Status").unwrap(),
        "MISS"
    );

    let hits_after_first = b1.hits();

    let response = app.post(request).await;
    assert_eq!(
        response.headers().get("X-Proxyd-Cache-Status").unwrap(),
        "HIT"
    );

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"], json!("0x1"));

    // no new upstream traffic for the cached answer
    assert_eq!(b1.hits(), hits_after_first);
}

#[test_log::test(tokio::test)]
async fn request_body_size_is_capped() {
    let b1 = MockRpc::spawn().await;

    let mut config = basic_config(&[("b1", &b1.url)], &[("eth_chainId", "main")]);
    config.app.max_body_size_bytes = 128;

    let app = TestApp::spawn(config).await;

    let padding = "x".repeat(256);
    let response = app
        .post_raw(format!(
            r#"{{"jsonrpc":"2.0","method":"eth_chainId","params":["{}"],"id":1}}"#,
            padding
        ))
        .await;

    assert_eq!(response.status().as_u16(), 413);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], json!(-32021));
}

// sender rate limiting with a chain-id allowlist
#[test_log::test(tokio::test)]
async fn sender_rate_limit_is_keyed_by_sender_and_nonce() {
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{Address, TransactionRequest};

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

    let b1 = MockRpc::spawn().await;

    let mut config = basic_config(
        &[("b1", &b1.url)],
        &[("eth_sendRawTransaction", "main")],
    );
    config.sender_rate_limit = serde_json::from_value(json!({
        "enabled": true,
        "limit": 1,
        "interval_seconds": 10,
        "allowed_chain_ids": [1],
    }))
    .unwrap();

    let app = TestApp::spawn(config).await;

    let wallet: LocalWallet =
        "0000000000000000000000000000000000000000000000000000000000000042"
            .parse()
            .unwrap();

    let send = |raw: String| {
        let app = &app;
        async move {
            let response = app
                .post(json!({
                    "jsonrpc": "2.0",
                    "method": "eth_sendRawTransaction",
                    "params": [raw],
                    "id": 1,
                }))
                .await;

            response.json::<Value>().await.unwrap()
        }
    };

    // first submission goes through
    let body = send(signed_raw_tx(&wallet, 5, 1)).await;
    assert!(body["result"].is_string(), "unexpected: {}", body);

    // same sender and nonce again is over the sender limit
    let body = send(signed_raw_tx(&wallet, 5, 1)).await;
    assert_eq!(body["error"]["code"], json!(-32017));

    // a transaction for another chain is invalid and burns no quota
    let body = send(signed_raw_tx(&wallet, 6, 2)).await;
    assert_eq!(body["error"]["code"], json!(-32602));

    // quota for a fresh nonce on the allowed chain is intact
    let body = send(signed_raw_tx(&wallet, 6, 1)).await;
    assert!(body["result"].is_string(), "unexpected: {}", body);
}
