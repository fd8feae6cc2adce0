use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use anyhow::Result;

/// Transaction fields handed to the signer for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub value: U256,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub raw: Bytes,
    pub hash: B256,
}

/// Key management lives outside the node; the engine only needs raw signed
/// bytes and the resulting transaction hash.
pub trait TxSigner: Send + Sync {
    fn sign(&self, tx: &UnsignedTx) -> Result<SignedTx>;
}

/// Deterministic signer for development chains and tests. The "raw" bytes are
/// a plain concatenation of the fields; a dev node must accept them as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsafeDevSigner;

impl TxSigner for UnsafeDevSigner {
    fn sign(&self, tx: &UnsignedTx) -> Result<SignedTx> {
        let mut raw = Vec::with_capacity(8 + 20 + 20 + 8 + 32 + 8 + 32 + tx.data.len());
        raw.extend_from_slice(&tx.chain_id.to_be_bytes());
        raw.extend_from_slice(tx.from.as_slice());
        raw.extend_from_slice(tx.to.as_slice());
        raw.extend_from_slice(&tx.nonce.to_be_bytes());
        raw.extend_from_slice(&tx.gas_price.to_be_bytes::<32>());
        raw.extend_from_slice(&tx.gas_limit.to_be_bytes());
        raw.extend_from_slice(&tx.value.to_be_bytes::<32>());
        raw.extend_from_slice(&tx.data);

        let hash = keccak256(&raw);
        Ok(SignedTx {
            raw: Bytes::from(raw),
            hash,
        })
    }
}
