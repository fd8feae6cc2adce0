//! Confirmation-gated delivery of contract logs to registered listeners.

pub mod broadcaster;

pub use broadcaster::{BroadcasterSettings, LogBroadcaster, LogListener};
