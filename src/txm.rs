//! Outgoing transactions: nonce allocation, signing, broadcast, gas bumps and
//! confirmation tracking against the canonical chain.

pub mod manager;
pub mod models;
pub mod nonce;
pub mod signer;

pub use manager::{TxManager, TxManagerSettings};
pub use models::{AttemptState, EthTx, NewTx, TxAttempt, TxOwner, TxProgress, TxState};
pub use signer::{SignedTx, TxSigner, UnsafeDevSigner, UnsignedTx};
