//! Ethereum JSON-RPC client plumbing: authentication, circuit breaker,
//! metrics, retry policy, and wire-format decoding.

pub mod auth;
pub mod circuit_breaker;
pub mod client;
pub mod metrics;
pub mod options;
pub mod retry;
pub mod wire;

pub use circuit_breaker::{
    CircuitBreakerError, CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker,
};
pub use client::{is_transient, EthRpcClient, RpcError};
pub use metrics::RpcMetricsSnapshot;
pub use options::RpcClientOptions;
