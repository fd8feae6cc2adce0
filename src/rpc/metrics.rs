//! Request counters for the chain RPC client.

use crate::rpc::circuit_breaker::CircuitState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct RpcMetrics {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_timeouts: AtomicU64,
    total_rejections: AtomicU64,
    total_latency_ns: AtomicU64,
}

impl RpcMetrics {
    fn record(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ns.fetch_add(
            latency.as_nanos().min(u128::from(u64::MAX)) as u64,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn record_success(&self, latency: Duration) {
        self.record(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.record(latency);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self, latency: Duration) {
        self.record_failure(latency);
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// The node answered with a JSON-RPC error object.
    pub(crate) fn record_rejection(&self, latency: Duration) {
        self.record(latency);
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, breaker_state: CircuitState) -> RpcMetricsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_latency_ns = self.total_latency_ns.load(Ordering::Relaxed);
        let average_latency_ms = if total_requests == 0 {
            0.0
        } else {
            (total_latency_ns as f64 / total_requests as f64) / 1_000_000.0
        };

        RpcMetricsSnapshot {
            total_requests,
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            average_latency_ms,
            breaker_state,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct RpcMetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_timeouts: u64,
    pub total_rejections: u64,
    pub average_latency_ms: f64,
    pub breaker_state: CircuitState,
}
