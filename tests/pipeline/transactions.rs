use alloy_primitives::{Address, U256};
use anyhow::Result;
use futures::future::join_all;
use oracleblock::{RunStatus, Store};
use serde_json::{json, Value};

use crate::support::{
    helpers::{
        assert_is_contiguous, base_config, node_address, wait_for_attempt_count,
        wait_for_run_status, wait_for_tx_id, TestNode, WAIT,
    },
    mock_chain::{connection_refused, decode_dev_tx, rejected, MockChain},
};

fn oracle() -> Address {
    Address::repeat_byte(0x42)
}

fn ethtx_job() -> Value {
    json!({
        "initiators": [{"type": "web"}],
        "tasks": [
            {"type": "ethuint256"},
            {"type": "ethtx", "params": {
                "address": oracle(),
                "functionSelector": "0x12345678"
            }}
        ]
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gas_bump_ladder_confirms_an_earlier_attempt() -> Result<()> {
    let config = base_config()
        .gas_bump_threshold(10)
        .min_outgoing_confirmations(20)
        .build()?;
    let test = TestNode::start(config, MockChain::new(11)).await?;
    let job_id = test.create_job(ethtx_job()).await?;

    let run = test
        .node
        .create_web_run(job_id, json!({"result": 7}))
        .await?;
    assert_eq!(run.status, RunStatus::PendingOutgoingConfirmations);
    let tx_id = wait_for_tx_id(&*test.store, run.id, WAIT).await?;
    assert_eq!(test.store.attempts_for_tx(tx_id).await?.len(), 1);

    test.mine_many(10).await?;
    wait_for_attempt_count(&*test.store, tx_id, 2, WAIT).await?;
    test.mine_many(10).await?;
    let attempts = wait_for_attempt_count(&*test.store, tx_id, 3, WAIT).await?;

    assert_eq!(attempts.len(), 3, "one attempt per elapsed threshold");
    for pair in attempts.windows(2) {
        assert!(
            pair[1].gas_price > pair[0].gas_price,
            "each bump must raise the gas price"
        );
    }
    let nonces: Vec<u64> = attempts
        .iter()
        .map(|attempt| decode_dev_tx(&attempt.raw).map(|tx| tx.nonce))
        .collect::<Result<_>>()?;
    assert!(nonces.iter().all(|nonce| *nonce == nonces[0]));

    // The middle attempt lands; the others stay unconfirmed.
    let landed = attempts[1].hash;
    test.chain.include(&[landed]);
    test.mine_many(20).await?;

    let run = wait_for_run_status(&*test.store, run.id, RunStatus::Completed, WAIT).await?;
    assert_eq!(run.result, Some(json!(landed.to_string())));
    assert_eq!(
        test.store.attempts_for_tx(tx_id).await?.len(),
        3,
        "no bumps after confirmation"
    );

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_get_contiguous_nonces() -> Result<()> {
    let chain = MockChain::new(5);
    chain.set_transaction_count(node_address(), 5);
    let test = TestNode::start(base_config().build()?, chain).await?;
    let job_id = test.create_job(ethtx_job()).await?;

    let runs = join_all((0..5).map(|i| test.node.create_web_run(job_id, json!({"result": i}))))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    assert!(runs
        .iter()
        .all(|run| run.status == RunStatus::PendingOutgoingConfirmations));

    let mut nonces: Vec<u64> = test
        .chain
        .sent()
        .iter()
        .map(|raw| decode_dev_tx(raw).map(|tx| tx.nonce))
        .collect::<Result<_>>()?;
    nonces.sort_unstable();
    assert_eq!(nonces.len(), 5);
    assert_eq!(nonces[0], 5, "first nonce comes from the chain");
    assert_is_contiguous(&nonces);

    test.chain.include(&test.chain.mempool());
    test.mine().await?;
    for run in runs {
        wait_for_run_status(&*test.store, run.id, RunStatus::Completed, WAIT).await?;
    }

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nonce_too_low_resyncs_once() -> Result<()> {
    let test = TestNode::start(base_config().build()?, MockChain::new(5)).await?;
    let job_id = test.create_job(ethtx_job()).await?;

    test.node.create_web_run(job_id, json!({"result": 1})).await?;
    assert_eq!(decode_dev_tx(&test.chain.sent()[0])?.nonce, 0);

    // Another wallet used nonces 1 and 2 behind the node's back.
    test.chain.set_transaction_count(node_address(), 3);
    test.chain.push_send_error(rejected("nonce too low"));
    let run = test.node.create_web_run(job_id, json!({"result": 2})).await?;
    assert_eq!(run.status, RunStatus::PendingOutgoingConfirmations);

    let sent = test.chain.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(decode_dev_tx(&sent[1])?.nonce, 3);

    test.chain.push_send_error(rejected("nonce too low"));
    test.chain.push_send_error(rejected("nonce too low"));
    let run = test.node.create_web_run(job_id, json!({"result": 3})).await?;
    assert_eq!(run.status, RunStatus::Errored, "a second rejection is fatal");

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_node_parks_run_until_next_head() -> Result<()> {
    let test = TestNode::start(base_config().build()?, MockChain::new(5)).await?;
    let job_id = test.create_job(ethtx_job()).await?;

    test.chain.push_send_error(connection_refused());
    let run = test.node.create_web_run(job_id, json!({"result": 9})).await?;
    assert_eq!(run.status, RunStatus::PendingConnection);
    assert!(test.chain.sent().is_empty());

    test.mine().await?;
    wait_for_run_status(
        &*test.store,
        run.id,
        RunStatus::PendingOutgoingConfirmations,
        WAIT,
    )
    .await?;
    assert_eq!(test.chain.sent().len(), 1);

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ommered_confirmation_errors_the_run() -> Result<()> {
    let config = base_config()
        .gas_bump_threshold(100)
        .min_outgoing_confirmations(5)
        .build()?;
    let test = TestNode::start(config, MockChain::new(11)).await?;
    let job_id = test.create_job(ethtx_job()).await?;

    let run = test.node.create_web_run(job_id, json!({"result": 3})).await?;
    let tx_id = wait_for_tx_id(&*test.store, run.id, WAIT).await?;
    let hash = test.store.attempts_for_tx(tx_id).await?[0].hash;

    let block = test.chain.include(&[hash]);
    test.wait_for_tip(block.number).await?;
    test.mine_many(2).await?;
    let pending = test.run(run.id).await?;
    assert_eq!(pending.status, RunStatus::PendingOutgoingConfirmations);

    // The confirming block is replaced by a longer branch without the tx.
    let tip = test.chain.reorg(block.number - 1, 5)?;
    test.wait_for_tip(tip.number).await?;

    let run = wait_for_run_status(&*test.store, run.id, RunStatus::Errored, WAIT).await?;
    assert!(run.error.unwrap_or_default().contains("orphaned"));

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gas_price_never_exceeds_the_cap() -> Result<()> {
    let gwei = U256::from(1_000_000_000u64);
    let config = base_config()
        .gas_bump_threshold(1)
        .default_gas_price(gwei * U256::from(20u64))
        .max_gas_price(gwei * U256::from(30u64))
        .build()?;
    let test = TestNode::start(config, MockChain::new(5)).await?;
    let job_id = test.create_job(ethtx_job()).await?;

    let run = test.node.create_web_run(job_id, json!({"result": 1})).await?;
    let tx_id = wait_for_tx_id(&*test.store, run.id, WAIT).await?;
    test.mine_many(2).await?;

    // 20 -> 25 -> 30 gwei, then the cap leaves no room for another bump.
    let attempts = wait_for_attempt_count(&*test.store, tx_id, 3, WAIT).await?;
    let last = attempts.last().map(|attempt| attempt.gas_price);
    assert_eq!(last, Some(gwei * U256::from(30u64)));

    test.mine_many(3).await?;
    let attempts = test.store.attempts_for_tx(tx_id).await?;
    assert_eq!(attempts.len(), 3);
    assert!(attempts
        .iter()
        .all(|attempt| attempt.gas_price <= gwei * U256::from(30u64)));

    test.stop().await
}
