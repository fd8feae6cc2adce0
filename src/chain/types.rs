use alloy_primitives::{Address, Bytes, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a block in the chain, identified by both height and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
}

impl BlockRef {
    pub fn new(number: u64, hash: B256) -> Self {
        Self { number, hash }
    }
}

/// A block header as seen by the head tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub received_at: DateTime<Utc>,
}

impl Head {
    pub fn new(number: u64, hash: B256, parent_hash: B256) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            received_at: Utc::now(),
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.number, self.hash)
    }

    /// True when `self` directly extends `parent`.
    pub fn is_child_of(&self, parent: &Head) -> bool {
        self.parent_hash == parent.hash && self.number == parent.number.saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub success: bool,
}

impl Receipt {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.block_number, self.block_hash)
    }
}

/// Identity of a log inside a specific block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogId {
    pub block_number: u64,
    pub block_hash: B256,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
    #[serde(default)]
    pub removed: bool,
}

impl Log {
    pub fn id(&self) -> LogId {
        LogId {
            block_number: self.block_number,
            block_hash: self.block_hash,
            log_index: self.log_index,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.block_number, self.block_hash)
    }
}

/// Address and positional topic constraints. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
}

impl LogFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    /// Restricts the topic at `position` to one of `alternatives`.
    pub fn with_topic(mut self, position: usize, alternatives: Vec<B256>) -> Self {
        if self.topics.len() <= position {
            self.topics.resize(position + 1, Vec::new());
        }
        self.topics[position] = alternatives;
        self
    }

    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }

        self.topics.iter().enumerate().all(|(position, alternatives)| {
            alternatives.is_empty()
                || log
                    .topics
                    .get(position)
                    .map(|topic| alternatives.contains(topic))
                    .unwrap_or(false)
        })
    }

    /// Smallest address-only filter that matches every log any of `filters` matches.
    pub fn address_union<'a>(filters: impl IntoIterator<Item = &'a LogFilter>) -> LogFilter {
        let mut addresses = Vec::new();
        for filter in filters {
            if filter.addresses.is_empty() {
                return LogFilter::any();
            }
            for address in &filter.addresses {
                if !addresses.contains(address) {
                    addresses.push(*address);
                }
            }
        }
        LogFilter {
            addresses,
            topics: Vec::new(),
        }
    }
}

/// A block range paired with a filter, as sent to `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub from_block: u64,
    pub to_block: u64,
    pub filter: LogFilter,
}
