use super::{Store, StoredHead};
use crate::chain::Head;
use crate::initiators::external::ExternalInitiator;
use crate::jobs::bridge::BridgeType;
use crate::jobs::run::{JobRun, RunStatus};
use crate::jobs::spec::JobSpec;
use crate::txm::models::{EthTx, TxAttempt, TxOwner, TxState};
use alloy_primitives::{Address, B256};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    heads: HashMap<B256, StoredHead>,
    canonical: BTreeMap<u64, B256>,
    jobs: HashMap<Uuid, JobSpec>,
    runs: HashMap<Uuid, JobRun>,
    bridges: BTreeMap<String, BridgeType>,
    external_initiators: BTreeMap<String, ExternalInitiator>,
    txs: HashMap<Uuid, EthTx>,
    nonces: HashMap<(Address, u64), Uuid>,
    released_nonces: BTreeSet<(Address, u64)>,
    attempts: HashMap<Uuid, Vec<TxAttempt>>,
    claimed_logs: HashSet<(String, B256, u64)>,
}

impl Tables {
    fn claim_nonce(&mut self, tx: &EthTx) -> Result<()> {
        let Some(nonce) = tx.nonce else {
            return Ok(());
        };
        match self.nonces.get(&(tx.from, nonce)) {
            Some(owner) if *owner != tx.id => {
                bail!("nonce {nonce} for {} already used by tx {owner}", tx.from)
            }
            Some(_) => Ok(()),
            None => {
                self.nonces.insert((tx.from, nonce), tx.id);
                self.released_nonces.remove(&(tx.from, nonce));
                Ok(())
            }
        }
    }
}

/// Store backed by in-memory tables behind a single async lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_head(&self, head: &Head) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.heads.contains_key(&head.hash) {
            return Ok(false);
        }
        tables.heads.insert(
            head.hash,
            StoredHead {
                head: head.clone(),
                superseded: false,
            },
        );
        Ok(true)
    }

    async fn head_by_hash(&self, hash: B256) -> Result<Option<StoredHead>> {
        Ok(self.tables.read().await.heads.get(&hash).cloned())
    }

    async fn mark_superseded(&self, hashes: &[B256]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for hash in hashes {
            if let Some(stored) = tables.heads.get_mut(hash) {
                stored.superseded = true;
            }
        }
        tables.canonical.retain(|_, hash| !hashes.contains(hash));
        Ok(())
    }

    async fn set_canonical(&self, head: &Head) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(stored) = tables.heads.get_mut(&head.hash) {
            stored.superseded = false;
        }
        tables.canonical.insert(head.number, head.hash);
        // Anything above a newly canonical head belongs to the replaced branch.
        let stale: Vec<u64> = tables
            .canonical
            .range(head.number.saturating_add(1)..)
            .map(|(number, _)| *number)
            .collect();
        for number in stale {
            tables.canonical.remove(&number);
        }
        Ok(())
    }

    async fn canonical_hash(&self, number: u64) -> Result<Option<B256>> {
        Ok(self.tables.read().await.canonical.get(&number).copied())
    }

    async fn recent_heads(&self, limit: usize) -> Result<Vec<Head>> {
        let tables = self.tables.read().await;
        let mut heads: Vec<Head> = tables
            .canonical
            .values()
            .rev()
            .take(limit)
            .filter_map(|hash| tables.heads.get(hash).map(|stored| stored.head.clone()))
            .collect();
        heads.reverse();
        Ok(heads)
    }

    async fn save_job(&self, job: &JobSpec) -> Result<()> {
        self.tables.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<JobSpec>> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn jobs(&self) -> Result<Vec<JobSpec>> {
        let mut jobs: Vec<JobSpec> = self.tables.read().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn save_run(&self, run: &JobRun) -> Result<()> {
        self.tables.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn run(&self, id: Uuid) -> Result<Option<JobRun>> {
        Ok(self.tables.read().await.runs.get(&id).cloned())
    }

    async fn runs_for_job(&self, job_id: Uuid) -> Result<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = self
            .tables
            .read()
            .await
            .runs
            .values()
            .filter(|run| run.job_id == job_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = self
            .tables
            .read()
            .await
            .runs
            .values()
            .filter(|run| statuses.contains(&run.status))
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn save_bridge(&self, bridge: &BridgeType) -> Result<()> {
        self.tables
            .write()
            .await
            .bridges
            .insert(bridge.name.clone(), bridge.clone());
        Ok(())
    }

    async fn bridge(&self, name: &str) -> Result<Option<BridgeType>> {
        Ok(self
            .tables
            .read()
            .await
            .bridges
            .get(&name.to_ascii_lowercase())
            .cloned())
    }

    async fn bridge_names(&self) -> Result<Vec<String>> {
        Ok(self.tables.read().await.bridges.keys().cloned().collect())
    }

    async fn save_external_initiator(&self, initiator: &ExternalInitiator) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = initiator.name.to_ascii_lowercase();
        if let Some(existing) = tables.external_initiators.get(&key) {
            if existing.access_key != initiator.access_key {
                bail!("external initiator {} already exists", initiator.name);
            }
        }
        tables.external_initiators.insert(key, initiator.clone());
        Ok(())
    }

    async fn external_initiator(&self, name: &str) -> Result<Option<ExternalInitiator>> {
        Ok(self
            .tables
            .read()
            .await
            .external_initiators
            .get(&name.to_ascii_lowercase())
            .cloned())
    }

    async fn external_initiator_by_access_key(
        &self,
        access_key: &str,
    ) -> Result<Option<ExternalInitiator>> {
        Ok(self
            .tables
            .read()
            .await
            .external_initiators
            .values()
            .find(|initiator| initiator.access_key == access_key)
            .cloned())
    }

    async fn insert_tx(&self, tx: &EthTx) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.txs.contains_key(&tx.id) {
            bail!("tx {} already exists", tx.id);
        }
        tables.claim_nonce(tx)?;
        tables.txs.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update_tx(&self, tx: &EthTx) -> Result<()> {
        let mut tables = self.tables.write().await;
        let Some(previous_nonce) = tables.txs.get(&tx.id).map(|existing| existing.nonce) else {
            bail!("tx {} does not exist", tx.id);
        };
        tables.claim_nonce(tx)?;
        if let Some(previous) = previous_nonce.filter(|previous| Some(*previous) != tx.nonce) {
            tables.nonces.remove(&(tx.from, previous));
        }
        tables.txs.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn tx(&self, id: Uuid) -> Result<Option<EthTx>> {
        Ok(self.tables.read().await.txs.get(&id).cloned())
    }

    async fn tx_for_owner(&self, owner: &TxOwner) -> Result<Option<EthTx>> {
        Ok(self
            .tables
            .read()
            .await
            .txs
            .values()
            .find(|tx| tx.owner == *owner)
            .cloned())
    }

    async fn txs_in_state(&self, state: TxState) -> Result<Vec<EthTx>> {
        let mut txs: Vec<EthTx> = self
            .tables
            .read()
            .await
            .txs
            .values()
            .filter(|tx| tx.state == state)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.from, tx.nonce, tx.created_at));
        Ok(txs)
    }

    async fn highest_nonce(&self, from: Address) -> Result<Option<u64>> {
        Ok(self
            .tables
            .read()
            .await
            .nonces
            .keys()
            .filter(|(address, _)| *address == from)
            .map(|(_, nonce)| *nonce)
            .max())
    }

    async fn release_nonce(&self, from: Address, nonce: u64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(owner) = tables.nonces.get(&(from, nonce)) {
            bail!("nonce {nonce} for {from} is still held by tx {owner}");
        }
        tables.released_nonces.insert((from, nonce));
        Ok(())
    }

    async fn lowest_released_nonce(&self, from: Address) -> Result<Option<u64>> {
        Ok(self
            .tables
            .read()
            .await
            .released_nonces
            .range((from, 0)..=(from, u64::MAX))
            .next()
            .map(|(_, nonce)| *nonce))
    }

    async fn save_attempt(&self, attempt: &TxAttempt) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.txs.contains_key(&attempt.tx_id) {
            bail!("attempt {} references unknown tx {}", attempt.id, attempt.tx_id);
        }
        let attempts = tables.attempts.entry(attempt.tx_id).or_default();
        match attempts.iter_mut().find(|existing| existing.id == attempt.id) {
            Some(existing) => *existing = attempt.clone(),
            None => attempts.push(attempt.clone()),
        }
        Ok(())
    }

    async fn attempts_for_tx(&self, tx_id: Uuid) -> Result<Vec<TxAttempt>> {
        Ok(self
            .tables
            .read()
            .await
            .attempts
            .get(&tx_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn claim_log(&self, listener: &str, tx_hash: B256, log_index: u64) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .await
            .claimed_logs
            .insert((listener.to_owned(), tx_hash, log_index)))
    }

    async fn release_log(&self, listener: &str, tx_hash: B256, log_index: u64) -> Result<()> {
        self.tables
            .write()
            .await
            .claimed_logs
            .remove(&(listener.to_owned(), tx_hash, log_index));
        Ok(())
    }
}
