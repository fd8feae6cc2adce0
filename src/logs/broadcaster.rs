use crate::chain::{ChainClient, Log, LogFilter, LogId, LogQuery};
use crate::processor::fanout::{guarded_call, CallOutcome, HeadEvent, HeadSubscriber};
use crate::processor::reorg::{BlockStatus, CanonicalChain};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

/// Consumer of contract logs with its own confirmation requirement.
pub trait LogListener: Send + Sync {
    /// Stable identity used to remember which logs this listener has seen.
    fn id(&self) -> &str;

    fn filter(&self) -> &LogFilter;

    /// Blocks that must be mined on top of a log's block before delivery.
    fn min_confirmations(&self) -> u64;

    fn handle_log<'a>(&'a self, log: &'a Log) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcasterSettings {
    /// Widest block range pulled for a single head.
    pub log_backfill_blocks: u64,
    pub call_budget: Duration,
}

struct Entry {
    log: Log,
    delivered_to: HashSet<String>,
}

#[derive(Default)]
struct State {
    /// Highest block whose logs have been pulled.
    cursor: Option<u64>,
    entries: BTreeMap<LogId, Entry>,
}

/// Pulls logs for every accepted head and hands each one to every matching
/// listener exactly once, after the listener's confirmation depth is
/// reached and while the log's block is still canonical.
pub struct LogBroadcaster {
    chain: Arc<dyn ChainClient>,
    canonical: Arc<CanonicalChain>,
    telemetry: Arc<Telemetry>,
    settings: BroadcasterSettings,
    listeners: RwLock<BTreeMap<String, Arc<dyn LogListener>>>,
    state: Mutex<State>,
}

impl LogBroadcaster {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        canonical: Arc<CanonicalChain>,
        telemetry: Arc<Telemetry>,
        settings: BroadcasterSettings,
    ) -> Self {
        Self {
            chain,
            canonical,
            telemetry,
            settings: BroadcasterSettings {
                log_backfill_blocks: settings.log_backfill_blocks.max(1),
                ..settings
            },
            listeners: RwLock::new(BTreeMap::new()),
            state: Mutex::new(State::default()),
        }
    }

    pub fn register(&self, listener: Arc<dyn LogListener>) {
        tracing::info!(
            listener = listener.id(),
            min_confirmations = listener.min_confirmations(),
            "log listener registered"
        );
        self.listeners
            .write()
            .expect("log listener registry poisoned")
            .insert(listener.id().to_string(), listener);
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self
            .listeners
            .write()
            .expect("log listener registry poisoned")
            .remove(id)
            .is_some();
        if removed {
            tracing::info!(listener = id, "log listener unregistered");
        }
        removed
    }

    pub async fn cursor(&self) -> Option<u64> {
        self.state.lock().await.cursor
    }

    fn snapshot(&self) -> Vec<Arc<dyn LogListener>> {
        self.listeners
            .read()
            .expect("log listener registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    async fn process_head(&self, event: &HeadEvent) -> Result<()> {
        let head = event.head.number;
        let listeners = self.snapshot();
        let mut state = self.state.lock().await;

        if let Some(reorg) = &event.reorg {
            let orphaned: Vec<LogId> = state
                .entries
                .keys()
                .filter(|id| id.block_number > reorg.common_ancestor)
                .copied()
                .collect();
            for id in &orphaned {
                state.entries.remove(id);
            }
            if state
                .cursor
                .is_some_and(|cursor| cursor > reorg.common_ancestor)
            {
                state.cursor = Some(reorg.common_ancestor);
            }
            tracing::info!(
                common_ancestor = reorg.common_ancestor,
                dropped = orphaned.len(),
                "log cursor rewound after reorg"
            );
        }

        if listeners.is_empty() {
            state.cursor = Some(head);
        } else {
            self.pull(&mut state, &listeners, head).await;
        }

        self.deliver(&mut state, &listeners, head).await;

        let retention = self.settings.log_backfill_blocks;
        let oldest_kept = head.saturating_sub(retention);
        state
            .entries
            .retain(|id, _| id.block_number >= oldest_kept);
        Ok(())
    }

    async fn pull(&self, state: &mut State, listeners: &[Arc<dyn LogListener>], head: u64) {
        let mut from = state.cursor.map(|cursor| cursor + 1).unwrap_or(head);
        if from > head {
            return;
        }
        let span = head - from + 1;
        if span > self.settings.log_backfill_blocks {
            let clamped = head + 1 - self.settings.log_backfill_blocks;
            tracing::warn!(
                from,
                clamped_from = clamped,
                head,
                "log gap exceeds backfill limit; skipping oldest blocks"
            );
            from = clamped;
        }

        let query = LogQuery {
            from_block: from,
            to_block: head,
            filter: LogFilter::address_union(listeners.iter().map(|listener| listener.filter())),
        };
        let logs = match self.chain.logs(&query).await {
            Ok(logs) => logs,
            Err(err) => {
                tracing::warn!(from, to = head, error = %err, "failed to pull logs; will retry on next head");
                return;
            }
        };

        let mut added = 0usize;
        for log in logs {
            if log.removed {
                continue;
            }
            if !listeners.iter().any(|listener| listener.filter().matches(&log)) {
                continue;
            }
            state.entries.entry(log.id()).or_insert_with(|| {
                added += 1;
                Entry {
                    log,
                    delivered_to: HashSet::new(),
                }
            });
        }
        if added > 0 {
            tracing::debug!(from, to = head, added, "logs pulled");
        }
        state.cursor = Some(head);
    }

    async fn deliver(&self, state: &mut State, listeners: &[Arc<dyn LogListener>], head: u64) {
        let mut orphaned = Vec::new();

        for (id, entry) in state.entries.iter_mut() {
            let depth = head.saturating_sub(id.block_number);
            let status = self.canonical.status(entry.log.block_ref());
            if status == BlockStatus::Orphaned {
                orphaned.push(*id);
                continue;
            }

            for listener in listeners {
                if entry.delivered_to.contains(listener.id())
                    || depth < listener.min_confirmations()
                    || !listener.filter().matches(&entry.log)
                    || !status.counts_as_canonical()
                {
                    continue;
                }

                let outcome = guarded_call(
                    self.settings.call_budget,
                    listener.handle_log(&entry.log),
                )
                .await;
                let (delivered, failed) = match outcome {
                    CallOutcome::Ok => (true, false),
                    CallOutcome::Failed(err) => {
                        tracing::warn!(listener = listener.id(), block = id.block_number, log_index = id.log_index, error = %err, "log listener failed; will retry");
                        (false, true)
                    }
                    CallOutcome::TimedOut => {
                        tracing::warn!(listener = listener.id(), block = id.block_number, log_index = id.log_index, "log listener exceeded its call budget; will retry");
                        (false, true)
                    }
                    CallOutcome::Panicked(panic) => {
                        tracing::error!(listener = listener.id(), block = id.block_number, log_index = id.log_index, panic = %panic, "log listener panicked");
                        (true, true)
                    }
                };
                if failed {
                    self.telemetry.record_subscriber_failure();
                } else {
                    self.telemetry.record_log_delivered();
                }
                if delivered {
                    entry.delivered_to.insert(listener.id().to_string());
                }
            }
        }

        for id in orphaned {
            tracing::debug!(block = id.block_number, log_index = id.log_index, "dropping log from orphaned block");
            state.entries.remove(&id);
        }
    }
}

impl HeadSubscriber for LogBroadcaster {
    fn name(&self) -> &str {
        "log_broadcaster"
    }

    fn on_new_head<'a>(&'a self, event: &'a HeadEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.process_head(event))
    }
}
