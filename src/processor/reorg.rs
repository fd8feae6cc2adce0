//! Canonical chain view shared by the head tracker and its subscribers.

use crate::chain::{BlockRef, Head};
use alloy_primitives::B256;
use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

/// Sliding window of block hashes used during reorg detection.
#[derive(Debug, Clone)]
pub struct ReorgWindow {
    limit: usize,
    items: VecDeque<(u64, B256)>,
}

impl ReorgWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            items: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, height: u64, hash: B256) {
        self.items.push_back((height, hash));
        if self.items.len() > self.limit {
            self.items.pop_front();
        }
    }

    pub fn find_hash(&self, hash: &B256) -> Option<u64> {
        self.items
            .iter()
            .rev()
            .find(|(_, existing_hash)| existing_hash == hash)
            .map(|(height, _)| *height)
    }

    pub fn hash_at(&self, height: u64) -> Option<B256> {
        let (lowest, _) = self.items.front()?;
        let offset = height.checked_sub(*lowest)?;
        self.items
            .get(usize::try_from(offset).ok()?)
            .filter(|(existing_height, _)| *existing_height == height)
            .map(|(_, hash)| *hash)
    }

    pub fn lowest(&self) -> Option<u64> {
        self.items.front().map(|(height, _)| *height)
    }

    /// Removes entries whose height is greater than the provided value while keeping
    /// the older portion of the window intact.
    pub fn truncate_after(&mut self, height: u64) {
        while matches!(self.items.back(), Some((existing_height, _)) if *existing_height > height) {
            self.items.pop_back();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u64, B256)> {
        self.items.iter()
    }
}

/// Where a block stands relative to the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// The window holds this exact hash at this height.
    Canonical,
    /// The window holds a different hash at this height.
    Orphaned,
    /// Above the current tip.
    Ahead,
    /// Older than the window; assumed final.
    Pruned,
}

impl BlockStatus {
    /// Whether confirmation math may treat the block as part of the chain.
    pub fn counts_as_canonical(self) -> bool {
        matches!(self, BlockStatus::Canonical | BlockStatus::Pruned)
    }
}

#[derive(Debug)]
struct ChainState {
    tip: Option<Head>,
    window: ReorgWindow,
    /// Blocks dropped by the last restart that are no longer canonical.
    abandoned: HashSet<B256>,
}

/// Tip plus a bounded window of canonical `(number, hash)` pairs. Only the
/// head tracker writes to it.
#[derive(Debug)]
pub struct CanonicalChain {
    state: RwLock<ChainState>,
}

impl CanonicalChain {
    pub fn new(window: usize) -> Self {
        Self {
            state: RwLock::new(ChainState {
                tip: None,
                window: ReorgWindow::new(window),
                abandoned: HashSet::new(),
            }),
        }
    }

    pub fn tip(&self) -> Option<Head> {
        self.read(|state| state.tip.clone())
    }

    pub fn tip_number(&self) -> Option<u64> {
        self.read(|state| state.tip.as_ref().map(|tip| tip.number))
    }

    pub fn hash_at(&self, number: u64) -> Option<B256> {
        self.read(|state| state.window.hash_at(number))
    }

    pub fn contains_hash(&self, hash: &B256) -> bool {
        self.read(|state| state.window.find_hash(hash).is_some())
    }

    pub fn status(&self, block: BlockRef) -> BlockStatus {
        self.read(|state| {
            let Some(tip) = state.tip.as_ref() else {
                return BlockStatus::Ahead;
            };
            if block.number > tip.number {
                return BlockStatus::Ahead;
            }
            match state.window.hash_at(block.number) {
                Some(hash) if hash == block.hash => BlockStatus::Canonical,
                Some(_) => BlockStatus::Orphaned,
                None if state.abandoned.contains(&block.hash) => BlockStatus::Orphaned,
                None => BlockStatus::Pruned,
            }
        })
    }

    /// Blocks mined on top of `number` by the current tip: `tip - number`.
    pub fn confirmations(&self, number: u64) -> Option<u64> {
        self.tip_number().map(|tip| tip.saturating_sub(number))
    }

    /// Replaces the window with `heads` (ascending); used at startup.
    pub fn seed(&self, heads: &[Head]) {
        self.write(|state| {
            state.window = ReorgWindow::new(state.window.limit());
            for head in heads {
                state.window.push(head.number, head.hash);
            }
            state.tip = heads.last().cloned();
            state.abandoned.clear();
        });
    }

    /// Window contents, ascending.
    pub fn blocks(&self) -> Vec<BlockRef> {
        self.read(|state| {
            state
                .window
                .iter()
                .map(|(number, hash)| BlockRef::new(*number, *hash))
                .collect()
        })
    }

    /// Empties the view; `abandoned` blocks read as orphaned from now on.
    pub fn restart(&self, abandoned: &[BlockRef]) {
        self.write(|state| {
            state.window = ReorgWindow::new(state.window.limit());
            state.tip = None;
            state.abandoned = abandoned.iter().map(|block| block.hash).collect();
        });
    }

    /// Makes `head` the new tip, dropping anything above its parent.
    pub fn apply(&self, head: &Head) {
        self.write(|state| {
            state.abandoned.remove(&head.hash);
            state.window.truncate_after(head.number.saturating_sub(1));
            state.window.push(head.number, head.hash);
            state.tip = Some(head.clone());
        });
    }

    fn read<T>(&self, f: impl FnOnce(&ChainState) -> T) -> T {
        let state = self.state.read().expect("canonical chain lock poisoned");
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut state = self.state.write().expect("canonical chain lock poisoned");
        f(&mut state)
    }
}
