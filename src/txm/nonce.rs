use crate::chain::ChainClient;
use crate::store::Store;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-account nonce bookkeeping. Callers hold the account guard from
/// [`NonceAllocator::lock`] across allocation and persistence so two
/// transactions for one account never observe the same "next" nonce.
pub struct NonceAllocator {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    accounts: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
}

impl NonceAllocator {
    pub fn new(chain: Arc<dyn ChainClient>, store: Arc<dyn Store>) -> Self {
        Self {
            chain,
            store,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, account: Address) -> OwnedMutexGuard<()> {
        let lock = self
            .accounts
            .lock()
            .expect("nonce account registry poisoned")
            .entry(account)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// A released nonce if the account has one, otherwise highest persisted
    /// nonce + 1, or the on-chain count for an account with no persisted
    /// transactions.
    pub async fn next_nonce(&self, account: Address) -> Result<u64> {
        if let Some(released) = self
            .store
            .lowest_released_nonce(account)
            .await
            .context("failed to read released nonces")?
        {
            return Ok(released);
        }
        let highest = self
            .store
            .highest_nonce(account)
            .await
            .context("failed to read highest persisted nonce")?;
        match highest {
            Some(highest) => Ok(highest + 1),
            None => self
                .chain
                .transaction_count(account)
                .await
                .with_context(|| format!("failed to fetch transaction count for {account}")),
        }
    }

    /// Nonce to use after the node rejected one as too low.
    pub async fn resync(&self, account: Address) -> Result<u64> {
        let on_chain = self
            .chain
            .transaction_count(account)
            .await
            .with_context(|| format!("failed to resync transaction count for {account}"))?;
        let local = self
            .store
            .highest_nonce(account)
            .await?
            .map(|highest| highest + 1)
            .unwrap_or(0);
        let nonce = on_chain.max(local);
        tracing::info!(%account, on_chain, local, nonce, "nonce resynchronised");
        Ok(nonce)
    }
}
