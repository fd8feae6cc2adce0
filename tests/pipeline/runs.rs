use std::time::{Duration, Instant};

use alloy_primitives::{Address, Bytes};
use anyhow::{bail, Result};
use chrono::Utc;
use hyper::{Method, StatusCode};
use oracleblock::initiators::run_log::{job_id_topic, ORACLE_REQUEST_TOPIC};
use oracleblock::{BridgeResponse, BridgeType, CallbackError, RunStatus, Store};
use serde_json::{json, Value};
use tokio::time::sleep;
use url::Url;

use crate::support::{
    helpers::{base_config, wait_for_run_status, wait_for_runs, TestNode, WAIT},
    mock_chain::MockChain,
    mock_http::{MockHttpServer, RecordedRequest},
};

fn oracle() -> Address {
    Address::repeat_byte(0x42)
}

fn callback_base() -> Result<Url> {
    Ok(Url::parse("http://node.example/")?)
}

async fn wait_for_requests(server: &MockHttpServer, count: usize) -> Result<Vec<RecordedRequest>> {
    let start = Instant::now();
    loop {
        let requests = server.requests();
        if requests.len() >= count {
            return Ok(requests);
        }
        if start.elapsed() > WAIT {
            bail!("mock server saw {} of {count} requests", requests.len());
        }
        sleep(Duration::from_millis(50)).await;
    }
}

fn as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::String(raw) => raw.parse().ok(),
        other => other.as_f64(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_bridge_resumes_on_authenticated_callback() -> Result<()> {
    let adapter = MockHttpServer::respond_with(StatusCode::OK, json!({"pending": true})).await?;
    let config = base_config().bridge_response_url(callback_base()?).build()?;
    let test = TestNode::start(config, MockChain::new(3)).await?;

    let bridge = test
        .node
        .register_bridge(BridgeType::new("PriceFeed", adapter.endpoint("/adapter")))
        .await?;
    assert_eq!(bridge.name, "pricefeed");
    let job_id = test
        .create_job(json!({
            "initiators": [{"type": "web"}],
            "tasks": [
                {"type": "pricefeed", "params": {"symbol": "ETH"}},
                {"type": "multiply", "params": {"times": 100}}
            ]
        }))
        .await?;

    let run = test
        .node
        .create_web_run(job_id, json!({"base": "USD"}))
        .await?;
    assert_eq!(run.status, RunStatus::PendingBridge);

    let requests = adapter.requests();
    assert_eq!(requests.len(), 1);
    let call = &requests[0];
    assert_eq!(call.method, Method::POST);
    assert_eq!(call.path, "/adapter");
    let expected_auth = format!("Bearer {}", bridge.outgoing_token);
    assert_eq!(call.header("authorization"), Some(expected_auth.as_str()));
    assert_eq!(call.body["id"], json!(run.id));
    assert_eq!(
        call.body["responseURL"],
        json!(format!("http://node.example/v2/runs/{}", run.id))
    );
    assert_eq!(call.body["data"]["symbol"], json!("ETH"));
    assert_eq!(call.body["data"]["base"], json!("USD"));

    let callback: BridgeResponse = serde_json::from_value(json!({"data": {"result": "1.5"}}))?;
    let denied = test
        .node
        .bridge_callback(run.id, &bridge.incoming_token, callback.clone())
        .await;
    assert!(matches!(denied, Err(CallbackError::Unauthorized)));
    assert_eq!(test.run(run.id).await?.status, RunStatus::PendingBridge);

    let run = test
        .node
        .bridge_callback(run.id, &bridge.outgoing_token, callback)
        .await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(as_f64(run.result.as_ref()), Some(150.0));

    test.stop().await?;
    adapter.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_run_rejects_late_callbacks() -> Result<()> {
    let adapter = MockHttpServer::respond_with(StatusCode::OK, json!({"pending": true})).await?;
    let test = TestNode::start(base_config().build()?, MockChain::new(3)).await?;
    let bridge = test
        .node
        .register_bridge(BridgeType::new("slow", adapter.url()))
        .await?;
    let job_id = test
        .create_job(json!({
            "initiators": [{"type": "web"}],
            "tasks": [{"type": "slow"}]
        }))
        .await?;

    let run = test.node.create_web_run(job_id, Value::Null).await?;
    assert_eq!(run.status, RunStatus::PendingBridge);

    let cancelled = test.node.cancel_run(run.id).await?;
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(test.run(run.id).await?.status, RunStatus::Cancelled);

    let late: BridgeResponse = serde_json::from_value(json!({"data": {"result": 1}}))?;
    let outcome = test
        .node
        .bridge_callback(run.id, &bridge.outgoing_token, late)
        .await;
    assert!(matches!(
        outcome,
        Err(CallbackError::NotPendingBridge {
            status: RunStatus::Cancelled,
            ..
        })
    ));
    assert!(test.node.cancel_run(run.id).await.is_err());
    assert_eq!(test.node.telemetry().snapshot().runs_cancelled, 1);

    test.stop().await?;
    adapter.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_log_waits_for_incoming_confirmations() -> Result<()> {
    let config = base_config().min_incoming_confirmations(3).build()?;
    let test = TestNode::start(config, MockChain::new(5)).await?;
    let job_id = test
        .create_job(json!({
            "initiators": [{"type": "runlog", "params": {"address": oracle()}}],
            "tasks": [{"type": "noop"}]
        }))
        .await?;

    let log = test.chain.emit_log(
        oracle(),
        vec![*ORACLE_REQUEST_TOPIC, job_id_topic(job_id)],
        Bytes::from_static(br#"{"result":"7","path":"price"}"#),
    );
    test.wait_for_tip(log.block_number).await?;

    let runs = wait_for_runs(&*test.store, job_id, 1, WAIT).await?;
    let run = &runs[0];
    assert_eq!(run.request.initiator, "runlog");
    assert_eq!(run.request.params, json!({"result": "7", "path": "price"}));
    wait_for_run_status(
        &*test.store,
        run.id,
        RunStatus::PendingIncomingConfirmations,
        WAIT,
    )
    .await?;

    test.mine_many(2).await?;
    let parked = test.run(run.id).await?;
    assert_eq!(parked.status, RunStatus::PendingIncomingConfirmations);
    assert!(parked.task_runs[0].observed_confirmations < 3);

    test.mine().await?;
    let done = wait_for_run_status(&*test.store, run.id, RunStatus::Completed, WAIT).await?;
    assert!(done.log_validated);

    // A request for another job is ignored.
    test.chain.emit_log(
        oracle(),
        vec![*ORACLE_REQUEST_TOPIC, job_id_topic(uuid::Uuid::new_v4())],
        Bytes::from_static(b"{}"),
    );
    test.mine_many(2).await?;
    assert_eq!(test.store.runs_for_job(job_id).await?.len(), 1);

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_log_moved_by_reorg_errors_the_run() -> Result<()> {
    let config = base_config().min_incoming_confirmations(3).build()?;
    let test = TestNode::start(config, MockChain::new(8)).await?;
    let job_id = test
        .create_job(json!({
            "initiators": [{"type": "runlog"}],
            "tasks": [{"type": "noop"}]
        }))
        .await?;

    let log = test.chain.emit_log(
        oracle(),
        vec![*ORACLE_REQUEST_TOPIC, job_id_topic(job_id)],
        Bytes::from_static(br#"{"result":"1"}"#),
    );
    test.wait_for_tip(log.block_number).await?;
    let runs = wait_for_runs(&*test.store, job_id, 1, WAIT).await?;
    let run_id = runs[0].id;

    // The request transaction is re-mined at the same height of a new branch.
    let tip = test
        .chain
        .reorg_including(log.block_number - 1, &[log.tx_hash], 5)?;
    test.wait_for_tip(tip.number).await?;

    let run = wait_for_run_status(&*test.store, run_id, RunStatus::Errored, WAIT).await?;
    assert!(run.error.unwrap_or_default().contains("orphaned"));
    assert_eq!(
        test.store.runs_for_job(job_id).await?.len(),
        1,
        "the orphaned log is not delivered again"
    );

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sleep_task_parks_until_deadline() -> Result<()> {
    let test = TestNode::start(base_config().build()?, MockChain::new(3)).await?;
    let until = Utc::now() + chrono::Duration::milliseconds(400);
    let job_id = test
        .create_job(json!({
            "initiators": [{"type": "web"}],
            "tasks": [{"type": "sleep", "params": {"until": until}}, {"type": "noop"}]
        }))
        .await?;

    let run = test
        .node
        .create_web_run(job_id, json!({"result": "awake"}))
        .await?;
    assert_eq!(run.status, RunStatus::PendingSleep);

    let run = wait_for_run_status(&*test.store, run.id, RunStatus::Completed, WAIT).await?;
    assert!(Utc::now() >= until);
    assert_eq!(run.result, Some(json!("awake")));

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_runs_are_posted_to_the_webhook() -> Result<()> {
    let webhook = MockHttpServer::respond_with(StatusCode::OK, json!({})).await?;
    let config = base_config().run_webhook_url(webhook.endpoint("/runs")).build()?;
    let test = TestNode::start(config, MockChain::new(3)).await?;
    let job_id = test
        .create_job(json!({
            "initiators": [{"type": "web"}],
            "tasks": [{"type": "copy", "params": {"copyPath": ["price"]}}]
        }))
        .await?;

    let run = test
        .node
        .create_web_run(job_id, json!({"price": "1234", "quote": "USD"}))
        .await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result, Some(json!("1234")));

    let posted = wait_for_requests(&webhook, 1).await?;
    assert_eq!(posted[0].path, "/runs");
    assert_eq!(posted[0].body["id"], json!(run.id));
    assert_eq!(posted[0].body["jobId"], json!(job_id));
    assert_eq!(posted[0].body["status"], json!("completed"));

    test.stop().await?;
    webhook.shutdown().await;
    Ok(())
}
