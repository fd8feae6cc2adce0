//! Chain-facing data types and the client abstraction every component uses to
//! talk to the blockchain node.

pub mod client;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use client::ChainClient;
pub use types::{BlockRef, Head, Log, LogFilter, LogId, LogQuery, Receipt};
