//! JSON shapes exchanged with the node and their conversion into chain types.
//! Quantities arrive as `0x`-prefixed hex and are decoded through `U64`.

use crate::chain::{Head, Log, LogQuery, Receipt};
use alloy_primitives::{Address, Bytes, B256, U64};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
}

impl From<WireBlock> for Head {
    fn from(block: WireBlock) -> Self {
        Head::new(block.number.to::<u64>(), block.hash, block.parent_hash)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireReceipt {
    pub transaction_hash: B256,
    pub block_hash: Option<B256>,
    pub block_number: Option<U64>,
    #[serde(default)]
    pub status: Option<U64>,
}

impl WireReceipt {
    /// Receipts without a block are still pending and treated as absent.
    pub(crate) fn into_receipt(self) -> Option<Receipt> {
        let block_hash = self.block_hash?;
        let block_number = self.block_number?.to::<u64>();
        Some(Receipt {
            tx_hash: self.transaction_hash,
            block_hash,
            block_number,
            // Pre-byzantium receipts carry no status field.
            success: self.status.map(|status| status == U64::from(1)).unwrap_or(true),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireLog {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    pub block_number: Option<U64>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<U64>,
    #[serde(default)]
    pub removed: bool,
}

impl WireLog {
    pub(crate) fn into_log(self) -> Option<Log> {
        Some(Log {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: self.block_number?.to::<u64>(),
            block_hash: self.block_hash?,
            tx_hash: self.transaction_hash?,
            log_index: self.log_index?.to::<u64>(),
            removed: self.removed,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireLogQuery {
    pub from_block: U64,
    pub to_block: U64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Option<Vec<B256>>>,
}

impl From<&LogQuery> for WireLogQuery {
    fn from(query: &LogQuery) -> Self {
        Self {
            from_block: U64::from(query.from_block),
            to_block: U64::from(query.to_block),
            address: query.filter.addresses.clone(),
            topics: query
                .filter
                .topics
                .iter()
                .map(|alternatives| (!alternatives.is_empty()).then(|| alternatives.clone()))
                .collect(),
        }
    }
}
