use crate::chain::BlockRef;
use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    InFlight,
    Confirmed,
    Errored,
}

/// The task run a transaction was created for. At most one transaction
/// exists per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOwner {
    pub run_id: Uuid,
    pub task_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTx {
    pub id: Uuid,
    pub from: Address,
    pub to: Address,
    /// Assigned under the account's nonce lock; `None` until then.
    pub nonce: Option<u64>,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub state: TxState,
    pub owner: TxOwner,
    pub created_at: DateTime<Utc>,
    pub confirmed_in: Option<BlockRef>,
    pub confirmed_hash: Option<B256>,
    pub error: Option<String>,
}

impl EthTx {
    pub fn new(request: NewTx) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: request.from,
            to: request.to,
            nonce: None,
            value: request.value,
            data: request.data,
            gas_limit: request.gas_limit,
            state: TxState::InFlight,
            owner: request.owner,
            created_at: Utc::now(),
            confirmed_in: None,
            confirmed_hash: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Unbroadcast,
    Broadcast,
    Confirmed,
    Errored,
}

/// One signed version of a transaction at a specific gas price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxAttempt {
    pub id: Uuid,
    pub tx_id: Uuid,
    pub gas_price: U256,
    pub raw: Bytes,
    pub hash: B256,
    pub state: AttemptState,
    pub broadcast_at_head: Option<u64>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TxAttempt {
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            AttemptState::Unbroadcast | AttemptState::Broadcast
        )
    }
}

/// Request to create a transaction for a task run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTx {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub owner: TxOwner,
}

/// Where a transaction stands relative to the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxProgress {
    Pending,
    Confirmed { confirmations: u64 },
    Safe { hash: B256 },
    Errored { reason: String },
}
