//! Log-driven initiators. Both kinds are [`LogListener`]s on the log
//! broadcaster; each log is claimed in the store before a run is created, so
//! a log the broadcaster hands over twice still yields one run. A claim whose
//! run could not be created is released again.

use crate::chain::{Log, LogFilter};
use crate::jobs::run::RunRequest;
use crate::jobs::runner::RunManager;
use crate::logs::LogListener;
use crate::store::Store;
use alloy_primitives::{keccak256, Address, B256};
use anyhow::Result;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// `OracleRequest(bytes32,address,bytes32,uint256,address,bytes4,uint256,uint256,bytes)`
pub static ORACLE_REQUEST_TOPIC: Lazy<B256> = Lazy::new(|| {
    keccak256("OracleRequest(bytes32,address,bytes32,uint256,address,bytes4,uint256,uint256,bytes)")
});

/// The job id as it appears in an oracle request: its 32 lowercase hex
/// digits taken as ASCII bytes.
pub fn job_id_topic(job_id: Uuid) -> B256 {
    let mut word = [0u8; 32];
    word.copy_from_slice(job_id.simple().to_string().as_bytes());
    B256::from(word)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogInitiator {
    /// Oracle requests addressed to the job.
    RunLog,
    /// Every log emitted by a contract.
    EthLog,
}

impl LogInitiator {
    fn label(self) -> &'static str {
        match self {
            LogInitiator::RunLog => "runlog",
            LogInitiator::EthLog => "ethlog",
        }
    }
}

pub struct LogInitiatorListener {
    id: String,
    kind: LogInitiator,
    job_id: Uuid,
    filter: LogFilter,
    runs: RunManager,
    store: Arc<dyn Store>,
}

impl LogInitiatorListener {
    pub fn run_log(
        job_id: Uuid,
        address: Option<Address>,
        runs: RunManager,
        store: Arc<dyn Store>,
    ) -> Self {
        let mut filter = LogFilter::any()
            .with_topic(0, vec![*ORACLE_REQUEST_TOPIC])
            .with_topic(1, vec![job_id_topic(job_id)]);
        if let Some(address) = address {
            filter = filter.with_address(address);
        }
        Self::new(LogInitiator::RunLog, job_id, filter, runs, store)
    }

    pub fn eth_log(job_id: Uuid, address: Address, runs: RunManager, store: Arc<dyn Store>) -> Self {
        let filter = LogFilter::any().with_address(address);
        Self::new(LogInitiator::EthLog, job_id, filter, runs, store)
    }

    fn new(
        kind: LogInitiator,
        job_id: Uuid,
        filter: LogFilter,
        runs: RunManager,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            id: listener_id(kind, job_id),
            kind,
            job_id,
            filter,
            runs,
            store,
        }
    }

    async fn create_run(&self, log: &Log) -> Result<()> {
        if !self
            .store
            .claim_log(&self.id, log.tx_hash, log.log_index)
            .await?
        {
            tracing::debug!(listener = %self.id, tx_hash = %log.tx_hash, log_index = log.log_index, "log already claimed");
            return Ok(());
        }

        let request = RunRequest::new(self.kind.label(), self.request_params(log)).with_log(log.clone());
        match self.runs.spawn_run(self.job_id, request).await {
            Ok(run) => tracing::info!(
                job_id = %self.job_id,
                run_id = %run.id,
                block = log.block_number,
                tx_hash = %log.tx_hash,
                "log initiated run"
            ),
            Err(err) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    tx_hash = %log.tx_hash,
                    error = %err,
                    "log matched but no run was created"
                );
                self.store
                    .release_log(&self.id, log.tx_hash, log.log_index)
                    .await?;
            }
        }
        Ok(())
    }

    fn request_params(&self, log: &Log) -> Value {
        match self.kind {
            LogInitiator::RunLog => match serde_json::from_slice::<Value>(&log.data) {
                Ok(Value::Object(params)) => Value::Object(params),
                _ => Value::Null,
            },
            LogInitiator::EthLog => json!({
                "address": log.address,
                "topics": log.topics,
                "data": log.data,
            }),
        }
    }
}

pub(crate) fn listener_id(kind: LogInitiator, job_id: Uuid) -> String {
    format!("{}:{job_id}", kind.label())
}

impl LogListener for LogInitiatorListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn filter(&self) -> &LogFilter {
        &self.filter
    }

    /// Delivered as soon as seen; the run itself waits for incoming
    /// confirmations and re-validates the log's block.
    fn min_confirmations(&self) -> u64 {
        0
    }

    fn handle_log<'a>(&'a self, log: &'a Log) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.create_run(log))
    }
}
