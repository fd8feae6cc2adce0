//! Broadcast, gas bumping and confirmation tracking for outgoing transactions.

use super::models::{AttemptState, EthTx, NewTx, TxAttempt, TxProgress, TxState};
use super::nonce::NonceAllocator;
use super::signer::{TxSigner, UnsignedTx};
use crate::chain::{BlockRef, ChainClient};
use crate::processor::fanout::{HeadEvent, HeadSubscriber};
use crate::processor::reorg::{BlockStatus, CanonicalChain};
use crate::rpc::is_transient;
use crate::runtime::telemetry::Telemetry;
use crate::store::Store;
use alloy_primitives::U256;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxManagerSettings {
    pub chain_id: u64,
    pub default_gas_price: U256,
    pub max_gas_price: U256,
    /// Blocks an attempt may stay unconfirmed before it is bumped.
    pub gas_bump_threshold: u64,
    pub gas_bump_percent: u64,
    pub gas_bump_min: U256,
    /// Depth after which a confirmation is no longer re-checked for orphaning.
    pub min_outgoing_confirmations: u64,
}

impl TxManagerSettings {
    /// `max(prev * (100 + pct) / 100, prev + min)` capped at the maximum, or
    /// `None` once the cap leaves no room above `previous`.
    pub fn bumped_gas_price(&self, previous: U256) -> Option<U256> {
        let scaled = previous.saturating_mul(U256::from(100 + self.gas_bump_percent))
            / U256::from(100u64);
        let next = scaled
            .max(previous.saturating_add(self.gas_bump_min))
            .min(self.max_gas_price);
        (next > previous).then_some(next)
    }
}

enum SendError {
    NonceTooLow,
    AlreadyKnown,
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

fn classify_send_error(err: anyhow::Error) -> SendError {
    let message = format!("{err:#}").to_ascii_lowercase();
    if message.contains("nonce too low") {
        SendError::NonceTooLow
    } else if message.contains("already known") || message.contains("known transaction") {
        SendError::AlreadyKnown
    } else if is_transient(&err) {
        SendError::Transient(err)
    } else {
        SendError::Fatal(err)
    }
}

pub struct TxManager {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    signer: Arc<dyn TxSigner>,
    canonical: Arc<CanonicalChain>,
    nonces: NonceAllocator,
    telemetry: Arc<Telemetry>,
    settings: TxManagerSettings,
    head_lock: Mutex<()>,
}

impl TxManager {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        signer: Arc<dyn TxSigner>,
        canonical: Arc<CanonicalChain>,
        telemetry: Arc<Telemetry>,
        settings: TxManagerSettings,
    ) -> Self {
        Self {
            nonces: NonceAllocator::new(chain.clone(), store.clone()),
            chain,
            store,
            signer,
            canonical,
            telemetry,
            settings,
            head_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &TxManagerSettings {
        &self.settings
    }

    /// Creates (or finds) the transaction owned by `request.owner`, assigns
    /// its nonce and broadcasts the first attempt.
    ///
    /// Returns `Err` only when the work could not be finished; a transient
    /// error is safe to retry with the same request. Node rejections are
    /// recorded on the returned transaction as `TxState::Errored`.
    pub async fn submit(&self, request: NewTx) -> Result<EthTx> {
        let _account = self.nonces.lock(request.from).await;

        let mut tx = match self.store.tx_for_owner(&request.owner).await? {
            Some(existing) => existing,
            None => {
                let tx = EthTx::new(request);
                self.store
                    .insert_tx(&tx)
                    .await
                    .context("failed to persist transaction")?;
                self.telemetry.record_tx_created();
                tracing::info!(
                    tx_id = %tx.id,
                    run_id = %tx.owner.run_id,
                    task_index = tx.owner.task_index,
                    from = %tx.from,
                    to = %tx.to,
                    "transaction created"
                );
                tx
            }
        };
        if tx.state != TxState::InFlight {
            return Ok(tx);
        }

        if tx.nonce.is_none() {
            let nonce = match self.nonces.next_nonce(tx.from).await {
                Ok(nonce) => nonce,
                Err(err) if is_transient(&err) => return Err(err),
                Err(err) => {
                    self.fail_tx(&mut tx, format!("nonce allocation failed: {err:#}"))
                        .await?;
                    return Ok(tx);
                }
            };
            tx.nonce = Some(nonce);
            self.store
                .update_tx(&tx)
                .await
                .context("failed to persist assigned nonce")?;
            tracing::debug!(tx_id = %tx.id, nonce, "nonce assigned");
        }

        let attempts = self.store.attempts_for_tx(tx.id).await?;
        let attempt = match attempts.last() {
            Some(attempt) => attempt.clone(),
            None => {
                self.new_attempt(&tx, self.settings.default_gas_price)
                    .await?
            }
        };
        if attempt.state == AttemptState::Unbroadcast {
            let head = self.canonical.tip_number().unwrap_or(0);
            self.broadcast(&mut tx, attempt, head).await?;
        }
        Ok(tx)
    }

    /// Where `tx_id` stands with `required` confirmations counted from the
    /// current tip.
    pub async fn tx_progress(&self, tx_id: Uuid, required: u64) -> Result<TxProgress> {
        let tx = self
            .store
            .tx(tx_id)
            .await?
            .ok_or_else(|| anyhow!("unknown transaction {tx_id}"))?;

        Ok(match tx.state {
            TxState::InFlight => TxProgress::Pending,
            TxState::Errored => TxProgress::Errored {
                reason: tx
                    .error
                    .unwrap_or_else(|| "transaction failed".to_string()),
            },
            TxState::Confirmed => {
                let (Some(block), Some(hash)) = (tx.confirmed_in, tx.confirmed_hash) else {
                    return Ok(TxProgress::Pending);
                };
                let confirmations = self.canonical.confirmations(block.number).unwrap_or(0);
                if confirmations >= required {
                    TxProgress::Safe { hash }
                } else {
                    TxProgress::Confirmed { confirmations }
                }
            }
        })
    }

    async fn new_attempt(&self, tx: &EthTx, gas_price: U256) -> Result<TxAttempt> {
        let nonce = tx
            .nonce
            .ok_or_else(|| anyhow!("transaction {} has no nonce", tx.id))?;
        let signed = self
            .signer
            .sign(&UnsignedTx {
                chain_id: self.settings.chain_id,
                from: tx.from,
                to: tx.to,
                nonce,
                gas_price,
                gas_limit: tx.gas_limit,
                value: tx.value,
                data: tx.data.clone(),
            })
            .with_context(|| format!("failed to sign transaction {}", tx.id))?;

        let attempt = TxAttempt {
            id: Uuid::new_v4(),
            tx_id: tx.id,
            gas_price,
            raw: signed.raw,
            hash: signed.hash,
            state: AttemptState::Unbroadcast,
            broadcast_at_head: None,
            broadcast_at: None,
            created_at: Utc::now(),
        };
        self.store
            .save_attempt(&attempt)
            .await
            .context("failed to persist attempt")?;
        Ok(attempt)
    }

    /// Sends `attempt`. Transient failures come back as `Err` with the
    /// attempt left unbroadcast.
    ///
    /// On a first broadcast a "nonce too low" rejection resyncs the nonce and
    /// re-sends once, and any other rejection errors the transaction and
    /// releases its nonce. A rejected gas bump only errors the bump: an
    /// earlier attempt at the same nonce may already be mined, so the
    /// transaction keeps its nonce and waits for a receipt.
    async fn broadcast(&self, tx: &mut EthTx, mut attempt: TxAttempt, head: u64) -> Result<()> {
        let is_bump = self
            .store
            .attempts_for_tx(tx.id)
            .await?
            .iter()
            .any(|existing| existing.id != attempt.id && existing.state == AttemptState::Broadcast);
        let mut resynced = false;
        loop {
            let outcome = match self.chain.send_raw_transaction(&attempt.raw).await {
                Ok(_) => None,
                Err(err) => Some(classify_send_error(err)),
            };

            match outcome {
                None | Some(SendError::AlreadyKnown) => {
                    attempt.state = AttemptState::Broadcast;
                    attempt.broadcast_at_head = Some(head);
                    attempt.broadcast_at = Some(Utc::now());
                    self.store.save_attempt(&attempt).await?;
                    self.telemetry.record_attempt_broadcast();
                    tracing::info!(
                        tx_id = %tx.id,
                        hash = %attempt.hash,
                        nonce = tx.nonce,
                        gas_price = %attempt.gas_price,
                        head,
                        "attempt broadcast"
                    );
                    return Ok(());
                }
                Some(SendError::Transient(err)) => {
                    tracing::warn!(tx_id = %tx.id, hash = %attempt.hash, error = %err, "broadcast failed; will retry");
                    return Err(err);
                }
                Some(SendError::NonceTooLow) if is_bump => {
                    tracing::info!(
                        tx_id = %tx.id,
                        hash = %attempt.hash,
                        nonce = tx.nonce,
                        "bump rejected as nonce too low; awaiting receipt of an earlier attempt"
                    );
                    return self.reject_bump(attempt, head).await;
                }
                Some(SendError::Fatal(err)) if is_bump => {
                    tracing::warn!(tx_id = %tx.id, hash = %attempt.hash, error = %err, "gas bump rejected");
                    return self.reject_bump(attempt, head).await;
                }
                Some(SendError::NonceTooLow) if !resynced => {
                    resynced = true;
                    let nonce = self.nonces.resync(tx.from).await?;
                    tracing::warn!(tx_id = %tx.id, previous = tx.nonce, nonce, "nonce too low; resubmitting");
                    attempt.state = AttemptState::Errored;
                    self.store.save_attempt(&attempt).await?;

                    tx.nonce = Some(nonce);
                    self.store.update_tx(tx).await?;
                    attempt = self.new_attempt(tx, attempt.gas_price).await?;
                }
                Some(SendError::NonceTooLow) => {
                    attempt.state = AttemptState::Errored;
                    self.store.save_attempt(&attempt).await?;
                    return self
                        .fail_unsent_tx(tx, "nonce too low after resync".to_string())
                        .await;
                }
                Some(SendError::Fatal(err)) => {
                    attempt.state = AttemptState::Errored;
                    self.store.save_attempt(&attempt).await?;
                    return self
                        .fail_unsent_tx(tx, format!("broadcast rejected: {err:#}"))
                        .await;
                }
            }
        }
    }

    async fn reject_bump(&self, mut attempt: TxAttempt, head: u64) -> Result<()> {
        attempt.state = AttemptState::Errored;
        attempt.broadcast_at_head = Some(head);
        self.store.save_attempt(&attempt).await
    }

    /// Errors a transaction the node never accepted and gives its nonce back
    /// to the account.
    async fn fail_unsent_tx(&self, tx: &mut EthTx, reason: String) -> Result<()> {
        let released = tx.nonce.take();
        self.fail_tx(tx, reason).await?;
        if let Some(nonce) = released {
            self.store.release_nonce(tx.from, nonce).await?;
            tracing::info!(tx_id = %tx.id, from = %tx.from, nonce, "nonce released");
        }
        Ok(())
    }

    async fn fail_tx(&self, tx: &mut EthTx, reason: String) -> Result<()> {
        tracing::error!(tx_id = %tx.id, run_id = %tx.owner.run_id, reason = %reason, "transaction errored");
        tx.state = TxState::Errored;
        tx.error = Some(reason);
        self.store.update_tx(tx).await
    }

    async fn check_tx(&self, mut tx: EthTx, head: u64) -> Result<()> {
        match tx.state {
            TxState::Confirmed => self.check_confirmed(tx, head).await,
            TxState::InFlight => {
                if tx.nonce.is_none() {
                    return Ok(());
                }
                let attempts = self.store.attempts_for_tx(tx.id).await?;
                if attempts.is_empty() {
                    return Ok(());
                }
                if self.check_receipts(&mut tx, &attempts).await? {
                    return Ok(());
                }

                for attempt in attempts
                    .iter()
                    .filter(|attempt| attempt.state == AttemptState::Unbroadcast)
                {
                    if self
                        .broadcast(&mut tx, attempt.clone(), head)
                        .await
                        .is_err()
                        || tx.state != TxState::InFlight
                    {
                        return Ok(());
                    }
                }

                self.maybe_bump(&tx, &attempts, head).await
            }
            TxState::Errored => Ok(()),
        }
    }

    /// Returns true once any broadcast attempt has a canonical receipt.
    async fn check_receipts(&self, tx: &mut EthTx, attempts: &[TxAttempt]) -> Result<bool> {
        for attempt in attempts
            .iter()
            .filter(|attempt| attempt.state == AttemptState::Broadcast)
        {
            let receipt = match self.chain.transaction_receipt(attempt.hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(tx_id = %tx.id, hash = %attempt.hash, error = %err, "receipt lookup failed");
                    continue;
                }
            };
            let block = receipt.block_ref();
            if self.canonical.status(block) != BlockStatus::Canonical {
                tracing::debug!(
                    tx_id = %tx.id,
                    hash = %attempt.hash,
                    block = block.number,
                    "receipt block not canonical; ignoring"
                );
                continue;
            }

            let mut confirmed = attempt.clone();
            confirmed.state = AttemptState::Confirmed;
            self.store.save_attempt(&confirmed).await?;

            if !receipt.success {
                self.fail_tx(tx, format!("transaction {} reverted", attempt.hash))
                    .await?;
                return Ok(true);
            }

            tx.state = TxState::Confirmed;
            tx.confirmed_in = Some(block);
            tx.confirmed_hash = Some(attempt.hash);
            self.store.update_tx(tx).await?;
            self.telemetry.record_tx_confirmed();
            tracing::info!(
                tx_id = %tx.id,
                hash = %attempt.hash,
                block = block.number,
                gas_price = %attempt.gas_price,
                "transaction confirmed"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn check_confirmed(&self, mut tx: EthTx, head: u64) -> Result<()> {
        let Some(block) = tx.confirmed_in else {
            return Ok(());
        };
        if head.saturating_sub(block.number) >= self.settings.min_outgoing_confirmations {
            return Ok(());
        }
        if self.canonical.status(block).counts_as_canonical() {
            return Ok(());
        }

        let BlockRef { number, hash } = block;
        tracing::warn!(tx_id = %tx.id, block = number, %hash, "confirming block orphaned");
        self.fail_tx(&mut tx, "confirming block orphaned".to_string())
            .await
    }

    async fn maybe_bump(&self, tx: &EthTx, attempts: &[TxAttempt], head: u64) -> Result<()> {
        let Some(latest) = attempts
            .iter()
            .filter(|attempt| attempt.state == AttemptState::Broadcast)
            .max_by_key(|attempt| attempt.gas_price)
        else {
            return Ok(());
        };
        // A rejected bump still restarts the wait for the next one.
        let Some(broadcast_at) = attempts
            .iter()
            .filter(|attempt| attempt.state != AttemptState::Unbroadcast)
            .filter_map(|attempt| attempt.broadcast_at_head)
            .max()
        else {
            return Ok(());
        };
        if head.saturating_sub(broadcast_at) < self.settings.gas_bump_threshold {
            return Ok(());
        }
        let Some(gas_price) = self.settings.bumped_gas_price(latest.gas_price) else {
            tracing::debug!(tx_id = %tx.id, gas_price = %latest.gas_price, "gas price at cap; not bumping");
            return Ok(());
        };

        let mut tx = tx.clone();
        let attempt = self.new_attempt(&tx, gas_price).await?;
        self.telemetry.record_gas_bump();
        tracing::info!(
            tx_id = %tx.id,
            previous = %latest.gas_price,
            gas_price = %gas_price,
            head,
            "bumping gas price"
        );
        if let Err(err) = self.broadcast(&mut tx, attempt, head).await {
            tracing::warn!(tx_id = %tx.id, error = %err, "bumped attempt not broadcast yet");
        }
        Ok(())
    }

    async fn process_head(&self, head: u64) -> Result<()> {
        let _head = self.head_lock.lock().await;
        let mut txs = self.store.txs_in_state(TxState::Confirmed).await?;
        txs.extend(self.store.txs_in_state(TxState::InFlight).await?);

        for tx in txs {
            let tx_id = tx.id;
            let _account = self.nonces.lock(tx.from).await;
            if let Err(err) = self.check_tx(tx, head).await {
                tracing::warn!(tx_id = %tx_id, head, error = %err, "failed to evaluate transaction");
            }
        }
        Ok(())
    }
}

impl HeadSubscriber for TxManager {
    fn name(&self) -> &str {
        "tx_manager"
    }

    fn on_new_head<'a>(&'a self, event: &'a HeadEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.process_head(event.head.number))
    }
}
