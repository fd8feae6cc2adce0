//! Retry context and canned log messages shared by every chain RPC call so
//! breaker, timeout, and exhaustion events read the same across methods.

use crate::rpc::circuit_breaker::CircuitState;
use alloy_primitives::{Address, B256};
use anyhow::Error;
use std::time::Duration;

macro_rules! log_with_retry_ctx {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        let method = $ctx.method;
        match $ctx.subject {
            Some(RetrySubject::Block(number)) => {
                tracing::$level!(method, block = number, $($rest)*)
            }
            Some(RetrySubject::Range { from, to }) => {
                tracing::$level!(method, from_block = from, to_block = to, $($rest)*)
            }
            Some(RetrySubject::Tx(hash)) => tracing::$level!(method, tx_hash = %hash, $($rest)*),
            Some(RetrySubject::Account(address)) => {
                tracing::$level!(method, account = %address, $($rest)*)
            }
            None => tracing::$level!(method, $($rest)*),
        }
    }};
}

/// What a call is about, attached to every log line it produces.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RetrySubject {
    Block(u64),
    Range { from: u64, to: u64 },
    Tx(B256),
    Account(Address),
}

#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) permit: &'static str,
    pub(crate) circuit_open: &'static str,
    pub(crate) timeout: &'static str,
    pub(crate) retry: &'static str,
    pub(crate) exhausted: &'static str,
    pub(crate) rejected: &'static str,
}

#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    pub(crate) method: &'static str,
    subject: Option<RetrySubject>,
    messages: &'a RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(method: &'static str, messages: &'a RetryMessages) -> Self {
        Self {
            method,
            subject: None,
            messages,
        }
    }

    pub(crate) fn about(mut self, subject: RetrySubject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub(crate) fn log_permit(&self, state: CircuitState) {
        log_with_retry_ctx!(trace, self, breaker_state = ?state, "{}", self.messages.permit);
    }

    pub(crate) fn log_circuit_open(&self) {
        log_with_retry_ctx!(warn, self, "{}", self.messages.circuit_open);
    }

    pub(crate) fn log_timeout(&self, attempt: usize, backoff: Duration) {
        let backoff_ms = duration_to_millis(backoff);
        log_with_retry_ctx!(warn, self, attempt, backoff_ms, "{}", self.messages.timeout);
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error) {
        let backoff_ms = duration_to_millis(backoff);
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            backoff_ms,
            error = %err,
            "{}",
            self.messages.retry
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error) {
        log_with_retry_ctx!(error, self, attempt, error = %err, "{}", self.messages.exhausted);
    }

    pub(crate) fn log_rejected(&self, code: i32, message: &str) {
        log_with_retry_ctx!(debug, self, code, reason = message, "{}", self.messages.rejected);
    }
}

fn duration_to_millis(backoff: Duration) -> u64 {
    backoff.as_millis().min(u128::from(u64::MAX)) as u64
}

pub(crate) const QUERY_RETRY: RetryMessages = RetryMessages {
    permit: "circuit breaker permit acquired",
    circuit_open: "chain rpc circuit breaker open; rejecting query",
    timeout: "chain rpc query timed out; will retry",
    retry: "chain rpc query failed; retrying",
    exhausted: "chain rpc query exhausted retries",
    rejected: "chain rpc query rejected by node",
};

pub(crate) const SUBMIT_RETRY: RetryMessages = RetryMessages {
    permit: "circuit breaker permit acquired for transaction submission",
    circuit_open: "chain rpc circuit breaker open; deferring transaction submission",
    timeout: "transaction submission timed out; resubmitting",
    retry: "transaction submission failed; retrying",
    exhausted: "transaction submission exhausted retries",
    rejected: "transaction rejected by node",
};
