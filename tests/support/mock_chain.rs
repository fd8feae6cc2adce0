use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use oracleblock::chain::LogQuery;
use oracleblock::{ChainClient, Head, Log, Receipt, RpcError};

/// In-memory chain with scriptable mining, reorgs and send failures.
///
/// Transaction hashes are `keccak256(raw)`, matching the dev signer.
#[derive(Clone)]
pub struct MockChain {
    inner: Arc<Mutex<MockChainInner>>,
}

struct MockChainInner {
    heads: BTreeMap<u64, Head>,
    epoch: u64,
    receipts: HashMap<B256, Receipt>,
    mempool: Vec<B256>,
    sent: Vec<Bytes>,
    send_errors: VecDeque<anyhow::Error>,
    counts: HashMap<Address, u64>,
    logs: Vec<Log>,
    auto_mine: bool,
    log_counter: u64,
}

impl MockChain {
    /// A chain of `length` blocks, heights `0..length`.
    pub fn new(length: u64) -> Self {
        let mut heads = BTreeMap::new();
        let mut parent = B256::ZERO;
        for number in 0..length.max(1) {
            let head = build_head(number, parent, 0);
            parent = head.hash;
            heads.insert(number, head);
        }

        Self {
            inner: Arc::new(Mutex::new(MockChainInner {
                heads,
                epoch: 0,
                receipts: HashMap::new(),
                mempool: Vec::new(),
                sent: Vec::new(),
                send_errors: VecDeque::new(),
                counts: HashMap::new(),
                logs: Vec::new(),
                auto_mine: false,
                log_counter: 0,
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockChainInner) -> T) -> T {
        f(&mut self.inner.lock().expect("mock chain poisoned"))
    }

    /// Includes every pending transaction in the next mined block.
    pub fn set_auto_mine(&self, enabled: bool) {
        self.with(|inner| inner.auto_mine = enabled);
    }

    pub fn tip(&self) -> Head {
        self.with(|inner| inner.tip())
    }

    pub fn head_at(&self, number: u64) -> Option<Head> {
        self.with(|inner| inner.heads.get(&number).cloned())
    }

    pub fn mine_block(&self) -> Head {
        self.with(|inner| {
            let included = if inner.auto_mine {
                std::mem::take(&mut inner.mempool)
            } else {
                Vec::new()
            };
            inner.mine(&included)
        })
    }

    pub fn mine_blocks(&self, count: u64) -> Head {
        let mut tip = self.tip();
        for _ in 0..count {
            tip = self.mine_block();
        }
        tip
    }

    /// Mines a block containing exactly `hashes`.
    pub fn include(&self, hashes: &[B256]) -> Head {
        self.with(|inner| {
            inner.mempool.retain(|hash| !hashes.contains(hash));
            inner.mine(hashes)
        })
    }

    /// Replaces every block above `fork_height` with `new_len` fresh blocks.
    /// Transactions mined in dropped blocks return to the mempool; logs in
    /// them disappear.
    pub fn reorg(&self, fork_height: u64, new_len: u64) -> Result<Head> {
        self.reorg_including(fork_height, &[], new_len)
    }

    /// Like [`MockChain::reorg`], with `hashes` mined into the first block
    /// of the new branch.
    pub fn reorg_including(&self, fork_height: u64, hashes: &[B256], new_len: u64) -> Result<Head> {
        self.with(|inner| {
            if !inner.heads.contains_key(&fork_height) {
                bail!("cannot reorg: missing fork height {fork_height}");
            }
            inner.epoch += 1;
            let dropped: Vec<Head> = inner
                .heads
                .split_off(&(fork_height + 1))
                .into_values()
                .collect();
            let dropped_hashes: Vec<B256> = dropped.iter().map(|head| head.hash).collect();

            let orphaned: Vec<B256> = inner
                .receipts
                .values()
                .filter(|receipt| dropped_hashes.contains(&receipt.block_hash))
                .map(|receipt| receipt.tx_hash)
                .collect();
            for hash in orphaned {
                inner.receipts.remove(&hash);
                inner.mempool.push(hash);
            }
            inner
                .logs
                .retain(|log| !dropped_hashes.contains(&log.block_hash));

            inner.mempool.retain(|hash| !hashes.contains(hash));
            let mut tip = inner.tip();
            for index in 0..new_len {
                tip = if index == 0 {
                    inner.mine(hashes)
                } else {
                    inner.mine(&[])
                };
            }
            Ok(tip)
        })
    }

    /// Mines a block carrying one log from `address` and its transaction's
    /// receipt.
    pub fn emit_log(&self, address: Address, topics: Vec<B256>, data: Bytes) -> Log {
        self.with(|inner| {
            inner.log_counter += 1;
            let tx_hash = keccak256(format!("log-tx-{}", inner.log_counter));
            let head = inner.mine(&[]);
            inner.receipts.insert(
                tx_hash,
                Receipt {
                    tx_hash,
                    block_hash: head.hash,
                    block_number: head.number,
                    success: true,
                },
            );
            let log = Log {
                address,
                topics,
                data,
                block_number: head.number,
                block_hash: head.hash,
                tx_hash,
                log_index: 0,
                removed: false,
            };
            inner.logs.push(log.clone());
            log
        })
    }

    pub fn push_send_error(&self, err: anyhow::Error) {
        self.with(|inner| inner.send_errors.push_back(err));
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.with(|inner| inner.counts.insert(address, count));
    }

    /// Raw transactions the node accepted, in send order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.with(|inner| inner.sent.clone())
    }

    pub fn mempool(&self) -> Vec<B256> {
        self.with(|inner| inner.mempool.clone())
    }

    pub fn receipt(&self, hash: B256) -> Option<Receipt> {
        self.with(|inner| inner.receipts.get(&hash).cloned())
    }

    pub(crate) fn send_sync(&self, raw: &Bytes) -> Result<B256> {
        self.with(|inner| {
            if let Some(err) = inner.send_errors.pop_front() {
                return Err(err);
            }
            let hash = keccak256(raw);
            if inner.receipts.contains_key(&hash) || inner.mempool.contains(&hash) {
                return Err(anyhow::Error::new(RpcError::Rejected {
                    method: "eth_sendRawTransaction",
                    code: -32000,
                    message: "already known".to_owned(),
                }));
            }
            inner.sent.push(raw.clone());
            inner.mempool.push(hash);
            Ok(hash)
        })
    }

    pub(crate) fn count_sync(&self, address: Address) -> u64 {
        self.with(|inner| inner.counts.get(&address).copied().unwrap_or(0))
    }

    pub(crate) fn logs_sync(&self, query: &LogQuery) -> Vec<Log> {
        self.with(|inner| {
            inner
                .logs
                .iter()
                .filter(|log| {
                    log.block_number >= query.from_block
                        && log.block_number <= query.to_block
                        && query.filter.matches(log)
                })
                .cloned()
                .collect()
        })
    }
}

impl MockChainInner {
    fn tip(&self) -> Head {
        self.heads
            .values()
            .next_back()
            .cloned()
            .unwrap_or_else(|| build_head(0, B256::ZERO, 0))
    }

    fn mine(&mut self, included: &[B256]) -> Head {
        let parent = self.tip();
        let head = build_head(parent.number + 1, parent.hash, self.epoch);
        for hash in included {
            self.receipts.insert(
                *hash,
                Receipt {
                    tx_hash: *hash,
                    block_hash: head.hash,
                    block_number: head.number,
                    success: true,
                },
            );
        }
        self.heads.insert(head.number, head.clone());
        head
    }
}

impl ChainClient for MockChain {
    fn latest_head(&self) -> BoxFuture<'_, Result<Head>> {
        let head = self.tip();
        Box::pin(async move { Ok(head) })
    }

    fn head_by_number(&self, number: u64) -> BoxFuture<'_, Result<Option<Head>>> {
        let head = self.head_at(number);
        Box::pin(async move { Ok(head) })
    }

    fn send_raw_transaction<'a>(&'a self, raw: &'a Bytes) -> BoxFuture<'a, Result<B256>> {
        let result = self.send_sync(raw);
        Box::pin(async move { result })
    }

    fn transaction_receipt(&self, hash: B256) -> BoxFuture<'_, Result<Option<Receipt>>> {
        let receipt = self.receipt(hash);
        Box::pin(async move { Ok(receipt) })
    }

    fn transaction_count(&self, address: Address) -> BoxFuture<'_, Result<u64>> {
        let count = self.count_sync(address);
        Box::pin(async move { Ok(count) })
    }

    fn logs<'a>(&'a self, query: &'a LogQuery) -> BoxFuture<'a, Result<Vec<Log>>> {
        let logs = self.logs_sync(query);
        Box::pin(async move { Ok(logs) })
    }
}

fn build_head(number: u64, parent: B256, epoch: u64) -> Head {
    let mut seed = [0u8; 24];
    seed[..8].copy_from_slice(&number.to_be_bytes());
    seed[8..16].copy_from_slice(&epoch.to_be_bytes());
    seed[16..].copy_from_slice(&parent[..8]);
    Head::new(number, keccak256(seed), parent)
}

/// Fields of a transaction signed by the dev signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevTx {
    pub to: Address,
    pub nonce: u64,
    pub gas_price: U256,
}

/// Decodes `chain_id | from | to | nonce | gas_price | ...` as laid out by
/// the dev signer.
pub fn decode_dev_tx(raw: &Bytes) -> Result<DevTx> {
    if raw.len() < 88 {
        return Err(anyhow!("raw transaction too short: {} bytes", raw.len()));
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&raw[48..56]);
    Ok(DevTx {
        to: Address::from_slice(&raw[28..48]),
        nonce: u64::from_be_bytes(nonce),
        gas_price: U256::from_be_slice(&raw[56..88]),
    })
}

pub fn rejected(message: &str) -> anyhow::Error {
    anyhow::Error::new(RpcError::Rejected {
        method: "eth_sendRawTransaction",
        code: -32000,
        message: message.to_owned(),
    })
}

pub fn connection_refused() -> anyhow::Error {
    anyhow::Error::new(RpcError::Transport {
        method: "eth_sendRawTransaction",
        message: "connection refused".to_owned(),
    })
}
