//! Scriptable in-memory `ChainClient` for unit tests.

use super::{ChainClient, Head, Log, LogQuery, Receipt};
use crate::rpc::RpcError;
use alloy_primitives::{keccak256, Address, Bytes, B256};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    heads: BTreeMap<u64, Head>,
    receipts: HashMap<B256, Receipt>,
    counts: HashMap<Address, u64>,
    send_errors: VecDeque<anyhow::Error>,
    sent: Vec<Bytes>,
    logs: Vec<Log>,
    log_failures: usize,
    log_queries: Vec<LogQuery>,
}

#[derive(Default)]
pub(crate) struct StubChain {
    state: Mutex<State>,
}

pub(crate) fn block_hash(number: u64, branch: u8) -> B256 {
    let mut bytes = [branch; 32];
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

pub(crate) fn head_on(number: u64, branch: u8) -> Head {
    Head::new(
        number,
        block_hash(number, branch),
        block_hash(number.saturating_sub(1), branch),
    )
}

pub(crate) fn rejected(message: &str) -> anyhow::Error {
    anyhow::Error::new(RpcError::Rejected {
        method: "eth_sendRawTransaction",
        code: -32000,
        message: message.to_string(),
    })
}

pub(crate) fn unreachable_node() -> anyhow::Error {
    anyhow::Error::new(RpcError::Transport {
        method: "eth_sendRawTransaction",
        message: "connection refused".to_string(),
    })
}

impl StubChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().expect("stub chain poisoned"))
    }

    pub(crate) fn set_head(&self, head: Head) {
        self.with(|state| state.heads.insert(head.number, head));
    }

    pub(crate) fn set_transaction_count(&self, address: Address, count: u64) {
        self.with(|state| state.counts.insert(address, count));
    }

    pub(crate) fn push_send_error(&self, err: anyhow::Error) {
        self.with(|state| state.send_errors.push_back(err));
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.with(|state| state.sent.clone())
    }

    /// Mines the transaction with `raw` bytes into `block`.
    pub(crate) fn mine(&self, raw: &Bytes, block: &Head) -> B256 {
        let hash = keccak256(raw);
        self.with(|state| {
            state.receipts.insert(
                hash,
                Receipt {
                    tx_hash: hash,
                    block_hash: block.hash,
                    block_number: block.number,
                    success: true,
                },
            )
        });
        hash
    }

    pub(crate) fn set_receipt(&self, receipt: Receipt) {
        self.with(|state| state.receipts.insert(receipt.tx_hash, receipt));
    }

    pub(crate) fn push_log(&self, log: Log) {
        self.with(|state| state.logs.push(log));
    }

    pub(crate) fn remove_logs_in(&self, block_hash: B256) {
        self.with(|state| state.logs.retain(|log| log.block_hash != block_hash));
    }

    pub(crate) fn fail_logs(&self, times: usize) {
        self.with(|state| state.log_failures = times);
    }

    pub(crate) fn log_queries(&self) -> Vec<LogQuery> {
        self.with(|state| state.log_queries.clone())
    }
}

impl ChainClient for StubChain {
    fn latest_head(&self) -> BoxFuture<'_, Result<Head>> {
        let latest = self.with(|state| state.heads.values().next_back().cloned());
        Box::pin(async move { latest.ok_or_else(|| anyhow!("no heads mined yet")) })
    }

    fn head_by_number(&self, number: u64) -> BoxFuture<'_, Result<Option<Head>>> {
        let head = self.with(|state| state.heads.get(&number).cloned());
        Box::pin(async move { Ok(head) })
    }

    fn send_raw_transaction<'a>(&'a self, raw: &'a Bytes) -> BoxFuture<'a, Result<B256>> {
        let result = self.with(|state| match state.send_errors.pop_front() {
            Some(err) => Err(err),
            None => {
                state.sent.push(raw.clone());
                Ok(keccak256(raw))
            }
        });
        Box::pin(async move { result })
    }

    fn transaction_receipt(&self, hash: B256) -> BoxFuture<'_, Result<Option<Receipt>>> {
        let receipt = self.with(|state| state.receipts.get(&hash).cloned());
        Box::pin(async move { Ok(receipt) })
    }

    fn transaction_count(&self, address: Address) -> BoxFuture<'_, Result<u64>> {
        let count = self.with(|state| state.counts.get(&address).copied().unwrap_or(0));
        Box::pin(async move { Ok(count) })
    }

    fn logs<'a>(&'a self, query: &'a LogQuery) -> BoxFuture<'a, Result<Vec<Log>>> {
        let result = self.with(|state| {
            state.log_queries.push(query.clone());
            if state.log_failures > 0 {
                state.log_failures -= 1;
                return Err(unreachable_node());
            }
            Ok(state
                .logs
                .iter()
                .filter(|log| {
                    log.block_number >= query.from_block
                        && log.block_number <= query.to_block
                        && query.filter.matches(log)
                })
                .cloned()
                .collect())
        });
        Box::pin(async move { result })
    }
}
