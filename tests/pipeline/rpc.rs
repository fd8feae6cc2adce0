use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{keccak256, Address, Bytes, B256};
use anyhow::Result;
use hyper::StatusCode;
use oracleblock::chain::LogQuery;
use oracleblock::rpc::is_transient;
use oracleblock::{
    EthRpcClient, LogFilter, OracleNode, RpcClientOptions, RpcError, RunStatus, UnsafeDevSigner,
};
use serde_json::json;

use crate::support::{
    helpers::{base_config, init_tracing, node_address, wait_for_run_status, wait_for_tip, WAIT},
    mock_chain::MockChain,
    mock_http::MockHttpServer,
    mock_rpc::json_rpc_handler,
};

async fn serve(chain: &MockChain) -> Result<MockHttpServer> {
    init_tracing();
    MockHttpServer::start(json_rpc_handler(chain.clone())).await
}

#[tokio::test]
async fn client_reads_heads_counts_and_logs() -> Result<()> {
    let chain = MockChain::new(5);
    chain.set_transaction_count(node_address(), 9);
    let contract = Address::repeat_byte(0x33);
    let log = chain.emit_log(contract, vec![B256::repeat_byte(0x01)], Bytes::from_static(b"hi"));
    chain.emit_log(Address::repeat_byte(0x34), Vec::new(), Bytes::new());

    let server = serve(&chain).await?;
    let client = EthRpcClient::new(server.url())?;

    let latest = client.latest_head().await?;
    assert_eq!(latest.hash, chain.tip().hash);
    assert_eq!(latest.number, 6);

    let second = client.head_by_number(2).await?.expect("block 2 exists");
    assert_eq!(Some(second.hash), chain.head_at(2).map(|head| head.hash));
    assert_eq!(second.parent_hash, chain.head_at(1).map(|head| head.hash).unwrap_or_default());
    assert!(client.head_by_number(100).await?.is_none());

    assert_eq!(client.transaction_count(node_address()).await?, 9);
    assert_eq!(client.transaction_count(Address::ZERO).await?, 0);

    let logs = client
        .logs(&LogQuery {
            from_block: 0,
            to_block: latest.number,
            filter: LogFilter::any().with_address(contract),
        })
        .await?;
    assert_eq!(logs, vec![log]);

    let metrics = client.metrics();
    assert_eq!(metrics.total_requests, 6);
    assert_eq!(metrics.total_errors, 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn send_reports_rejections_and_receipts_follow_mining() -> Result<()> {
    let chain = MockChain::new(3);
    let server = serve(&chain).await?;
    let client = EthRpcClient::new(server.url())?;

    let raw = Bytes::from_static(b"\x01\x02\x03");
    let hash = client.send_raw_transaction(&raw).await?;
    assert_eq!(hash, keccak256(&raw));
    assert!(client.transaction_receipt(hash).await?.is_none());

    let err = client
        .send_raw_transaction(&raw)
        .await
        .expect_err("duplicate submission is rejected");
    match err.downcast_ref::<RpcError>() {
        Some(RpcError::Rejected { message, .. }) => assert_eq!(message, "already known"),
        other => panic!("expected a node rejection, got {other:?}"),
    }
    assert!(!is_transient(&err));
    assert_eq!(client.metrics().total_rejections, 1);

    let block = chain.include(&[hash]);
    let receipt = client
        .transaction_receipt(hash)
        .await?
        .expect("mined transaction has a receipt");
    assert_eq!(receipt.block_hash, block.hash);
    assert_eq!(receipt.block_number, block.number);
    assert!(receipt.success);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_errors_are_retried_then_reported_as_transient() -> Result<()> {
    let server =
        MockHttpServer::respond_with(StatusCode::INTERNAL_SERVER_ERROR, json!({})).await?;
    let options = RpcClientOptions {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        ..RpcClientOptions::default()
    };
    let client = EthRpcClient::with_options(server.url(), options)?;

    let err = client
        .latest_head()
        .await
        .expect_err("a failing node yields an error");
    assert!(is_transient(&err));
    assert_eq!(server.requests().len(), 2);

    let metrics = client.metrics();
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.total_errors, 2);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_confirms_a_transaction_over_json_rpc() -> Result<()> {
    let chain = MockChain::new(4);
    chain.set_auto_mine(true);
    let server = serve(&chain).await?;

    let config = base_config()
        .rpc_url(server.url().as_str())
        .min_outgoing_confirmations(2)
        .build()?;
    let mut node = OracleNode::connect(config, Arc::new(UnsafeDevSigner))?;
    node.start().await?;
    wait_for_tip(&node, chain.tip().number, WAIT).await?;

    let request = serde_json::from_value(json!({
        "initiators": [{"type": "web"}],
        "tasks": [
            {"type": "ethbytes32"},
            {"type": "ethtx", "params": {"address": Address::repeat_byte(0x42)}}
        ]
    }))?;
    let job = node.create_job(&request).await?;
    let run = node.create_web_run(job.id, json!({"result": "hello"})).await?;
    assert_eq!(run.status, RunStatus::PendingOutgoingConfirmations);
    assert_eq!(chain.sent().len(), 1);

    let tip = chain.mine_blocks(3);
    wait_for_tip(&node, tip.number, WAIT).await?;
    let run = wait_for_run_status(node.store().as_ref(), run.id, RunStatus::Completed, WAIT).await?;
    let hash = keccak256(&chain.sent()[0]);
    assert_eq!(run.result, Some(json!(hash.to_string())));
    assert!(node.telemetry().snapshot().txs_confirmed >= 1);

    node.stop().await?;
    server.shutdown().await;
    Ok(())
}
