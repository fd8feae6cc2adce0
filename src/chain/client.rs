use crate::chain::types::{Head, Log, LogQuery, Receipt};
use alloy_primitives::{Address, Bytes, B256};
use anyhow::Result;
use futures::future::BoxFuture;

/// Operations the node needs from a blockchain JSON-RPC endpoint.
///
/// Head subscriptions are layered on top of `latest_head` by the head
/// listener, and log subscriptions on top of `logs` by the log broadcaster.
pub trait ChainClient: Send + Sync {
    fn latest_head(&self) -> BoxFuture<'_, Result<Head>>;

    /// Canonical head at `number` according to the node, or `None` when the
    /// node does not know that height yet.
    fn head_by_number(&self, number: u64) -> BoxFuture<'_, Result<Option<Head>>>;

    fn send_raw_transaction<'a>(&'a self, raw: &'a Bytes) -> BoxFuture<'a, Result<B256>>;

    fn transaction_receipt(&self, hash: B256) -> BoxFuture<'_, Result<Option<Receipt>>>;

    /// Pending transaction count for `address`, used as the account's next nonce.
    fn transaction_count(&self, address: Address) -> BoxFuture<'_, Result<u64>>;

    fn logs<'a>(&'a self, query: &'a LogQuery) -> BoxFuture<'a, Result<Vec<Log>>>;
}
