use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use alloy_primitives::Address;
use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use oracleblock::txm::TxAttempt;
use oracleblock::{
    JobRun, JobSpecRequest, MemoryStore, NodeConfig, NodeConfigBuilder, OracleNode, RunStatus,
    Store, UnsafeDevSigner,
};
use serde_json::Value;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use super::mock_chain::MockChain;

pub const WAIT: Duration = Duration::from_secs(10);

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn node_address() -> Address {
    Address::repeat_byte(0x11)
}

/// Config with fast polling; tests override the knobs they exercise.
pub fn base_config() -> NodeConfigBuilder {
    NodeConfig::builder()
        .rpc_url("http://127.0.0.1:8545")
        .chain_id(1337)
        .from_address(node_address())
        .head_poll_interval(Duration::from_millis(20))
        .metrics_interval(Duration::from_millis(200))
        .bridge_timeout(Duration::from_secs(2))
        .min_incoming_confirmations(0)
        .min_outgoing_confirmations(1)
}

pub struct TestNode {
    pub node: OracleNode,
    pub chain: MockChain,
    pub store: Arc<MemoryStore>,
}

impl TestNode {
    pub async fn start(config: NodeConfig, chain: MockChain) -> Result<Self> {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let mut node = OracleNode::new(
            config,
            Arc::new(chain.clone()),
            store.clone(),
            Arc::new(UnsafeDevSigner),
        )?;
        node.start().await?;
        let tip = chain.tip().number;
        let test = Self { node, chain, store };
        test.wait_for_tip(tip).await?;
        Ok(test)
    }

    pub async fn stop(mut self) -> Result<()> {
        self.node.stop().await
    }

    pub async fn create_job(&self, spec: Value) -> Result<Uuid> {
        let request: JobSpecRequest = serde_json::from_value(spec)?;
        Ok(self.node.create_job(&request).await?.id)
    }

    /// Mines one block and waits until the node has accepted it.
    pub async fn mine(&self) -> Result<u64> {
        let head = self.chain.mine_block();
        self.wait_for_tip(head.number).await?;
        Ok(head.number)
    }

    pub async fn mine_many(&self, count: u64) -> Result<u64> {
        let mut tip = self.chain.tip().number;
        for _ in 0..count {
            tip = self.mine().await?;
        }
        Ok(tip)
    }

    pub async fn wait_for_tip(&self, target: u64) -> Result<()> {
        wait_for_tip(&self.node, target, WAIT).await
    }

    pub async fn run(&self, run_id: Uuid) -> Result<JobRun> {
        match self.store.run(run_id).await? {
            Some(run) => Ok(run),
            None => bail!("run {run_id} does not exist"),
        }
    }
}

pub async fn wait_for_tip(node: &OracleNode, target: u64, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        let current = node.head_tracker().canonical().tip_number();
        if current.map(|tip| tip >= target).unwrap_or(false) {
            return Ok(());
        }
        if start.elapsed() > timeout {
            let reported = current
                .map(|tip| tip.to_string())
                .unwrap_or_else(|| "<none>".to_owned());
            bail!("node did not reach head {target} within {timeout:?} (tip: {reported})");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_for_run_status(
    store: &dyn Store,
    run_id: Uuid,
    status: RunStatus,
    timeout: Duration,
) -> Result<JobRun> {
    let start = Instant::now();
    loop {
        let run = store.run(run_id).await?;
        if let Some(run) = &run {
            if run.status == status {
                return Ok(run.clone());
            }
        }
        if start.elapsed() > timeout {
            let reported = run
                .map(|run| format!("{:?}", run.status))
                .unwrap_or_else(|| "<missing>".to_owned());
            bail!("run {run_id} did not reach {status:?} within {timeout:?} (status: {reported})");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_for_runs(
    store: &dyn Store,
    job_id: Uuid,
    count: usize,
    timeout: Duration,
) -> Result<Vec<JobRun>> {
    let start = Instant::now();
    loop {
        let runs = store.runs_for_job(job_id).await?;
        if runs.len() >= count {
            return Ok(runs);
        }
        if start.elapsed() > timeout {
            bail!(
                "job {job_id} did not create {count} runs within {timeout:?} (runs: {})",
                runs.len()
            );
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_for_attempt_count(
    store: &dyn Store,
    tx_id: Uuid,
    count: usize,
    timeout: Duration,
) -> Result<Vec<TxAttempt>> {
    let start = Instant::now();
    loop {
        let attempts = store.attempts_for_tx(tx_id).await?;
        if attempts.len() >= count {
            return Ok(attempts);
        }
        if start.elapsed() > timeout {
            bail!(
                "transaction {tx_id} did not reach {count} attempts within {timeout:?} (attempts: {})",
                attempts.len()
            );
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Waits for the first task of `run_id` that created a transaction.
pub async fn wait_for_tx_id(store: &dyn Store, run_id: Uuid, timeout: Duration) -> Result<Uuid> {
    let start = Instant::now();
    loop {
        if let Some(run) = store.run(run_id).await? {
            if let Some(tx_id) = run.task_runs.iter().find_map(|task_run| task_run.tx_id) {
                return Ok(tx_id);
            }
        }
        if start.elapsed() > timeout {
            bail!("run {run_id} created no transaction within {timeout:?}");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Asserts that `nonces` form a gap-free ascending sequence.
pub fn assert_is_contiguous(nonces: &[u64]) {
    for window in nonces.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "nonces must increase without gaps");
        }
    }
}
