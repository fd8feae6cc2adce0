//! Durable state behind the node. Every component reads and writes through
//! [`Store`]; [`MemoryStore`] is the in-process implementation.

pub mod memory;

pub use memory::MemoryStore;

use crate::chain::Head;
use crate::initiators::external::ExternalInitiator;
use crate::jobs::bridge::BridgeType;
use crate::jobs::run::{JobRun, RunStatus};
use crate::jobs::spec::JobSpec;
use crate::txm::models::{EthTx, TxAttempt, TxOwner, TxState};
use alloy_primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// A persisted head and whether a reorg replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHead {
    pub head: Head,
    pub superseded: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persists `head`; returns `false` when the same hash was already stored.
    async fn insert_head(&self, head: &Head) -> Result<bool>;
    async fn head_by_hash(&self, hash: B256) -> Result<Option<StoredHead>>;
    /// Flags `hashes` as replaced and drops them from the canonical mapping.
    async fn mark_superseded(&self, hashes: &[B256]) -> Result<()>;
    /// Records `head` as the canonical block at its height.
    async fn set_canonical(&self, head: &Head) -> Result<()>;
    async fn canonical_hash(&self, number: u64) -> Result<Option<B256>>;
    /// Up to `limit` canonical heads ending at the highest one, ascending.
    async fn recent_heads(&self, limit: usize) -> Result<Vec<Head>>;

    async fn save_job(&self, job: &JobSpec) -> Result<()>;
    async fn job(&self, id: Uuid) -> Result<Option<JobSpec>>;
    async fn jobs(&self) -> Result<Vec<JobSpec>>;

    async fn save_run(&self, run: &JobRun) -> Result<()>;
    async fn run(&self, id: Uuid) -> Result<Option<JobRun>>;
    async fn runs_for_job(&self, job_id: Uuid) -> Result<Vec<JobRun>>;
    async fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<JobRun>>;

    async fn save_bridge(&self, bridge: &BridgeType) -> Result<()>;
    async fn bridge(&self, name: &str) -> Result<Option<BridgeType>>;
    async fn bridge_names(&self) -> Result<Vec<String>>;

    async fn save_external_initiator(&self, initiator: &ExternalInitiator) -> Result<()>;
    async fn external_initiator(&self, name: &str) -> Result<Option<ExternalInitiator>>;
    async fn external_initiator_by_access_key(
        &self,
        access_key: &str,
    ) -> Result<Option<ExternalInitiator>>;

    /// Fails when another transaction from the same account holds the nonce.
    async fn insert_tx(&self, tx: &EthTx) -> Result<()>;
    /// Same nonce uniqueness rule as [`Store::insert_tx`].
    async fn update_tx(&self, tx: &EthTx) -> Result<()>;
    async fn tx(&self, id: Uuid) -> Result<Option<EthTx>>;
    async fn tx_for_owner(&self, owner: &TxOwner) -> Result<Option<EthTx>>;
    async fn txs_in_state(&self, state: TxState) -> Result<Vec<EthTx>>;
    async fn highest_nonce(&self, from: Address) -> Result<Option<u64>>;
    /// Returns a nonce the node never accepted to the account. It stays
    /// released until a transaction claims it again.
    async fn release_nonce(&self, from: Address, nonce: u64) -> Result<()>;
    async fn lowest_released_nonce(&self, from: Address) -> Result<Option<u64>>;

    async fn save_attempt(&self, attempt: &TxAttempt) -> Result<()>;
    /// Attempts in creation order, which is also ascending gas price.
    async fn attempts_for_tx(&self, tx_id: Uuid) -> Result<Vec<TxAttempt>>;

    /// Marks `(tx_hash, log_index)` as consumed by `listener`. Returns `false`
    /// when it was already claimed.
    async fn claim_log(&self, listener: &str, tx_hash: B256, log_index: u64) -> Result<bool>;
    /// Undoes [`Store::claim_log`] so the log can be consumed again.
    async fn release_log(&self, listener: &str, tx_hash: B256, log_index: u64) -> Result<()>;
}
