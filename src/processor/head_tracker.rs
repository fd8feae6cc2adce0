//! Head tracker: accepts heads in delivery order, backfills gaps, detects
//! reorgs, and fans every newly canonical head out to subscribers.

use super::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use super::fanout::{HeadEvent, HeadFanout, ReorgInfo};
use super::reorg::CanonicalChain;
use crate::chain::{BlockRef, ChainClient, Head};
use crate::rpc::is_transient;
use crate::runtime::telemetry::Telemetry;
use crate::store::Store;
use anyhow::{anyhow, bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const BACKFILL_INITIAL_BACKOFF_MS: u64 = 100;
const BACKFILL_MAX_BACKOFF_MS: u64 = 2_000;
const BACKFILL_MAX_ATTEMPTS: usize = 5;

/// What the tracker did with a delivered head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadAcceptance {
    /// The head (and `backfilled` ancestors) became canonical and were fanned out.
    Accepted {
        backfilled: usize,
        reorg: Option<ReorgInfo>,
    },
    /// Already the canonical block at its height.
    Duplicate,
    /// Persisted, but not above the current tip.
    Stale,
}

struct Segment {
    /// Ascending; the delivered head is last.
    heads: Vec<Head>,
    /// Whether the oldest head's parent is in the canonical window.
    connected: bool,
}

pub struct HeadTracker {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    canonical: Arc<CanonicalChain>,
    fanout: Arc<HeadFanout>,
    telemetry: Arc<Telemetry>,
    max_backfill_depth: u64,
    connected: AtomicBool,
    delivery: Mutex<()>,
    shutdown: CancellationToken,
}

impl HeadTracker {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        canonical: Arc<CanonicalChain>,
        fanout: Arc<HeadFanout>,
        telemetry: Arc<Telemetry>,
        max_backfill_depth: u64,
    ) -> Self {
        Self {
            chain,
            store,
            canonical,
            fanout,
            telemetry,
            max_backfill_depth: max_backfill_depth.max(1),
            connected: AtomicBool::new(false),
            delivery: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Backfill retries give up once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn canonical(&self) -> &Arc<CanonicalChain> {
        &self.canonical
    }

    /// Restores the canonical window from persisted heads.
    pub async fn start(&self, window: usize) -> Result<Option<Head>> {
        let heads = self
            .store
            .recent_heads(window)
            .await
            .context("failed to load persisted heads")?;
        self.canonical.seed(&heads);

        let tip = self.canonical.tip();
        match &tip {
            Some(tip) => tracing::info!(
                tip = tip.number,
                hash = %tip.hash,
                seeded = heads.len(),
                "head tracker restored canonical chain"
            ),
            None => tracing::info!("head tracker starting without persisted heads"),
        }
        Ok(tip)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::SeqCst)
    }

    pub async fn on_new_head(&self, head: Head) -> Result<HeadAcceptance> {
        let _delivery = self.delivery.lock().await;
        self.telemetry.record_head_received();

        self.store
            .insert_head(&head)
            .await
            .with_context(|| format!("failed to persist head {}", head.number))?;

        let tip = self.canonical.tip();
        if let Some(tip) = &tip {
            if self.canonical.hash_at(head.number) == Some(head.hash) {
                tracing::trace!(head = head.number, "duplicate head ignored");
                return Ok(HeadAcceptance::Duplicate);
            }
            if head.number <= tip.number {
                tracing::debug!(
                    head = head.number,
                    hash = %head.hash,
                    tip = tip.number,
                    "non-canonical head at or below tip; keeping as candidate branch"
                );
                return Ok(HeadAcceptance::Stale);
            }
        }

        let segment = self.collect_segment(head, tip.is_some()).await?;
        let backfilled = segment.heads.len().saturating_sub(1);
        self.telemetry.record_backfilled_heads(backfilled as u64);

        let mut reorg = match (&tip, segment.connected) {
            (_, true) => self.detect_reorg(&segment.heads[0]).await?,
            (None, false) => None,
            (Some(tip), false) => {
                tracing::warn!(
                    tip = tip.number,
                    oldest = segment.heads[0].number,
                    max_backfill_depth = self.max_backfill_depth,
                    "head does not connect within max backfill depth; restarting canonical view"
                );
                self.restart_view(&segment.heads).await?
            }
        };
        let accepted_reorg = reorg.clone();

        for head in &segment.heads {
            self.store
                .set_canonical(head)
                .await
                .with_context(|| format!("failed to mark head {} canonical", head.number))?;
            self.canonical.apply(head);
            self.telemetry.record_head_accepted();

            let event = HeadEvent {
                head: head.clone(),
                reorg: reorg.take(),
            };
            tracing::debug!(head = head.number, hash = %head.hash, "new canonical head");
            self.fanout.publish(&event).await;
        }

        Ok(HeadAcceptance::Accepted {
            backfilled,
            reorg: accepted_reorg,
        })
    }

    /// Walks parent links back from `head` until one attaches to the window.
    async fn collect_segment(&self, head: Head, has_tip: bool) -> Result<Segment> {
        let mut heads = vec![head];
        if !has_tip {
            return Ok(Segment {
                heads,
                connected: true,
            });
        }

        loop {
            let oldest = &heads[0];
            if oldest.number == 0 {
                return Ok(Segment {
                    heads,
                    connected: false,
                });
            }
            let parent_number = oldest.number - 1;
            if self.canonical.hash_at(parent_number) == Some(oldest.parent_hash) {
                return Ok(Segment {
                    heads,
                    connected: true,
                });
            }
            if heads.len() as u64 > self.max_backfill_depth {
                return Ok(Segment {
                    heads,
                    connected: false,
                });
            }

            let parent = self.find_parent(oldest).await?;
            heads.insert(0, parent);
        }
    }

    async fn find_parent(&self, child: &Head) -> Result<Head> {
        if let Some(stored) = self.store.head_by_hash(child.parent_hash).await? {
            return Ok(stored.head);
        }

        let number = child.number - 1;
        let fetched = self.fetch_head(number).await?;
        if fetched.hash != child.parent_hash {
            bail!(
                "node returned block {number} with hash {} but head {} expects parent {}",
                fetched.hash,
                child.number,
                child.parent_hash
            );
        }
        self.store.insert_head(&fetched).await?;
        tracing::debug!(head = number, hash = %fetched.hash, "backfilled missing ancestor");
        Ok(fetched)
    }

    async fn fetch_head(&self, number: u64) -> Result<Head> {
        let chain = &self.chain;
        retry_with_backoff(
            RetryBackoff::new(
                Duration::from_millis(BACKFILL_INITIAL_BACKOFF_MS),
                Duration::from_millis(BACKFILL_MAX_BACKOFF_MS),
            )
            .with_max_attempts(BACKFILL_MAX_ATTEMPTS)
            .with_cancellation(&self.shutdown),
            |_| async move {
                chain
                    .head_by_number(number)
                    .await?
                    .ok_or_else(|| anyhow!("node does not know block {number}"))
            },
            |attempt, backoff, err, will_retry| {
                if will_retry {
                    tracing::warn!(
                        attempt,
                        head = number,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "failed to backfill head; retrying"
                    );
                } else {
                    tracing::error!(attempt, head = number, error = %err, "failed to backfill head; giving up");
                }
            },
            |_, err| {
                if is_transient(err) {
                    RetryDisposition::Retry
                } else {
                    RetryDisposition::Abort
                }
            },
        )
        .await
        .with_context(|| format!("failed to fetch head {number}"))
    }

    /// Drops the canonical window for a head that could not be attached.
    /// Old blocks the node no longer has at their height are superseded,
    /// walking down from the old tip until one still matches.
    async fn restart_view(&self, segment: &[Head]) -> Result<Option<ReorgInfo>> {
        let mut replaced = Vec::new();
        for block in self.canonical.blocks().into_iter().rev() {
            let current = match segment.iter().find(|head| head.number == block.number) {
                Some(head) => head.hash,
                None => self.fetch_head(block.number).await?.hash,
            };
            if current == block.hash {
                break;
            }
            replaced.push(block);
        }
        replaced.reverse();
        self.canonical.restart(&replaced);

        let Some(lowest) = replaced.first() else {
            return Ok(None);
        };
        let hashes: Vec<_> = replaced.iter().map(|block| block.hash).collect();
        self.store
            .mark_superseded(&hashes)
            .await
            .context("failed to mark abandoned heads superseded")?;
        self.telemetry.record_reorg();

        let common_ancestor = lowest.number.saturating_sub(1);
        let depth = replaced.len() as u64;
        tracing::warn!(common_ancestor, depth, "abandoned branch superseded");
        Ok(Some(ReorgInfo {
            common_ancestor,
            depth,
            replaced,
        }))
    }

    /// Canonical blocks above the new branch's attach point get superseded.
    async fn detect_reorg(&self, first: &Head) -> Result<Option<ReorgInfo>> {
        let Some(tip) = self.canonical.tip() else {
            return Ok(None);
        };
        let common_ancestor = first.number.saturating_sub(1);
        if tip.number <= common_ancestor {
            return Ok(None);
        }

        let replaced: Vec<BlockRef> = (first.number..=tip.number)
            .filter_map(|number| {
                self.canonical
                    .hash_at(number)
                    .map(|hash| BlockRef::new(number, hash))
            })
            .collect();
        if replaced.is_empty() {
            return Ok(None);
        }

        let hashes: Vec<_> = replaced.iter().map(|block| block.hash).collect();
        self.store
            .mark_superseded(&hashes)
            .await
            .context("failed to mark reorged heads superseded")?;
        self.telemetry.record_reorg();

        let depth = replaced.len() as u64;
        tracing::warn!(
            old_tip = tip.number,
            old_hash = %tip.hash,
            common_ancestor,
            depth,
            "reorg detected; switching to new branch"
        );

        Ok(Some(ReorgInfo {
            common_ancestor,
            depth,
            replaced,
        }))
    }
}
