//! Head processing: the polling listener, gap backfill and reorg detection,
//! the canonical chain view, and ordered fan-out to subscribers.

pub mod backoff;
pub mod fanout;
pub mod head_tracker;
pub mod lifecycle;
pub mod listener;
pub mod reorg;
