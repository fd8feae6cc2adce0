use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, Bytes, B256};
use anyhow::Result;
use futures::future::BoxFuture;
use oracleblock::{HeadEvent, HeadSubscriber, RunStatus, Store};
use serde_json::json;

use crate::support::{
    helpers::{base_config, wait_for_run_status, wait_for_runs, TestNode, WAIT},
    mock_chain::MockChain,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<HeadEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<HeadEvent> {
        self.events.lock().expect("recorder poisoned").clone()
    }

    fn numbers(&self) -> Vec<u64> {
        self.events().iter().map(|event| event.head.number).collect()
    }
}

impl HeadSubscriber for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_new_head<'a>(&'a self, event: &'a HeadEvent) -> BoxFuture<'a, Result<()>> {
        self.events
            .lock()
            .expect("recorder poisoned")
            .push(event.clone());
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gaps_are_backfilled_in_order() -> Result<()> {
    let test = TestNode::start(base_config().build()?, MockChain::new(5)).await?;
    let recorder = Arc::new(Recorder::default());
    test.node.head_fanout().register(recorder.clone());

    // Several blocks appear between two polls.
    let tip = test.chain.mine_blocks(6);
    test.wait_for_tip(tip.number).await?;

    assert_eq!(recorder.numbers(), vec![5, 6, 7, 8, 9, 10]);
    assert!(recorder.events().iter().all(|event| event.reorg.is_none()));
    for (number, hash) in (5..=10).map(|number| (number, test.chain.head_at(number))) {
        assert_eq!(
            test.node.head_tracker().canonical().hash_at(number),
            hash.map(|head| head.hash)
        );
    }

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reorg_replaces_the_canonical_branch() -> Result<()> {
    let test = TestNode::start(base_config().build()?, MockChain::new(10)).await?;
    test.mine_many(3).await?;
    let old_branch: Vec<B256> = (10..=12)
        .filter_map(|number| test.node.head_tracker().canonical().hash_at(number))
        .collect();
    assert_eq!(old_branch.len(), 3);

    let recorder = Arc::new(Recorder::default());
    test.node.head_fanout().register(recorder.clone());

    let tip = test.chain.reorg(9, 5)?;
    test.wait_for_tip(tip.number).await?;

    let canonical = test.node.head_tracker().canonical();
    for number in 10..=14 {
        let expected = test.chain.head_at(number).map(|head| head.hash);
        assert_eq!(canonical.hash_at(number), expected, "height {number}");
    }
    assert!(old_branch.iter().all(|hash| !canonical.contains_hash(hash)));

    let events = recorder.events();
    let first = events.first().expect("the new branch is published");
    assert_eq!(first.head.number, 10, "delivery restarts above the fork");
    let reorg = first.reorg.clone().expect("first head of the branch carries the reorg");
    assert_eq!(reorg.common_ancestor, 9);
    assert_eq!(reorg.depth, 3);
    assert_eq!(
        reorg.replaced.iter().map(|block| block.hash).collect::<Vec<_>>(),
        old_branch
    );
    assert!(events[1..].iter().all(|event| event.reorg.is_none()));
    assert_eq!(recorder.numbers(), vec![10, 11, 12, 13, 14]);

    assert!(test.node.telemetry().snapshot().reorgs >= 1);

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_subscriber_does_not_block_delivery() -> Result<()> {
    struct Failing;

    impl HeadSubscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_new_head<'a>(&'a self, _event: &'a HeadEvent) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Err(anyhow::anyhow!("subscriber exploded")) })
        }
    }

    let test = TestNode::start(base_config().build()?, MockChain::new(3)).await?;
    let recorder = Arc::new(Recorder::default());
    test.node.head_fanout().register(Arc::new(Failing));
    test.node.head_fanout().register(recorder.clone());

    test.mine_many(2).await?;

    assert_eq!(recorder.numbers(), vec![3, 4]);
    assert!(test.node.telemetry().snapshot().subscriber_failures >= 2);

    test.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_log_starts_exactly_one_run() -> Result<()> {
    let contract = Address::repeat_byte(0x77);
    let test = TestNode::start(base_config().build()?, MockChain::new(5)).await?;
    let job_id = test
        .create_job(json!({
            "initiators": [{"type": "ethlog", "params": {"address": contract}}],
            "tasks": [{"type": "noop"}]
        }))
        .await?;

    let log = test.chain.emit_log(
        contract,
        vec![B256::repeat_byte(0xab)],
        Bytes::from_static(b"payload"),
    );
    // Unrelated contract.
    test.chain
        .emit_log(Address::repeat_byte(0x78), Vec::new(), Bytes::new());
    test.wait_for_tip(test.chain.tip().number).await?;
    test.mine_many(5).await?;

    let runs = wait_for_runs(&*test.store, job_id, 1, WAIT).await?;
    let run = wait_for_run_status(&*test.store, runs[0].id, RunStatus::Completed, WAIT).await?;
    assert_eq!(run.request.initiator, "ethlog");
    assert_eq!(
        run.request.log.as_ref().map(|log| log.tx_hash),
        Some(log.tx_hash)
    );
    assert!(run.log_validated);

    assert_eq!(test.store.runs_for_job(job_id).await?.len(), 1);
    assert_eq!(test.node.telemetry().snapshot().logs_delivered, 1);

    test.stop().await
}
