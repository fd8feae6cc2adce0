//! `ChainClient` implementation over an Ethereum node's HTTP JSON-RPC
//! endpoint, plus the error type callers downcast to tell transient failures
//! from node rejections.

use crate::chain::{ChainClient, Head, Log, LogQuery, Receipt};
use crate::rpc::auth::endpoint_with_auth;
use crate::rpc::circuit_breaker::{CircuitBreakerError, RpcCircuitBreaker};
use crate::rpc::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::rpc::options::RpcClientOptions;
use crate::rpc::retry::{RetryContext, RetrySubject, QUERY_RETRY, SUBMIT_RETRY};
use crate::rpc::wire::{WireBlock, WireLog, WireLogQuery, WireReceipt};
use crate::runtime::config::NodeConfig;
use alloy_primitives::{Address, Bytes, B256, U64};
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use jsonrpsee::core::{
    client::{ClientT, Error as JsonRpcError},
    http_helpers::HttpError,
    params::ArrayParams,
};
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc};
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    CircuitOpen,
    Transport { method: &'static str, message: String },
    /// The node answered with a JSON-RPC error object.
    Rejected { method: &'static str, code: i32, message: String },
    ResponseTooLarge { method: &'static str },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::CircuitOpen => write!(f, "rpc circuit breaker is open"),
            RpcError::Transport { method, message } => {
                write!(f, "rpc {method} transport failure: {message}")
            }
            RpcError::Rejected {
                method,
                code,
                message,
            } => write!(f, "rpc {method} rejected (code={code}): {message}"),
            RpcError::ResponseTooLarge { method } => {
                write!(f, "rpc {method} response exceeded HTTP size limits")
            }
        }
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Failures that say nothing about the request itself and may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. } | RpcError::CircuitOpen | RpcError::Transport { .. }
        )
    }
}

/// True when `err` wraps an [`RpcError`] that is worth retrying later.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RpcError>()
        .map(RpcError::is_transient)
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct EthRpcClient {
    endpoint: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
    metrics: Arc<RpcMetrics>,
    breaker: Arc<RpcCircuitBreaker>,
}

impl ChainClient for EthRpcClient {
    fn latest_head(&self) -> BoxFuture<'_, Result<Head>> {
        Box::pin(self.latest_head())
    }

    fn head_by_number(&self, number: u64) -> BoxFuture<'_, Result<Option<Head>>> {
        Box::pin(self.head_by_number(number))
    }

    fn send_raw_transaction<'a>(&'a self, raw: &'a Bytes) -> BoxFuture<'a, Result<B256>> {
        Box::pin(self.send_raw_transaction(raw))
    }

    fn transaction_receipt(&self, hash: B256) -> BoxFuture<'_, Result<Option<Receipt>>> {
        Box::pin(self.transaction_receipt(hash))
    }

    fn transaction_count(&self, address: Address) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.transaction_count(address))
    }

    fn logs<'a>(&'a self, query: &'a LogQuery) -> BoxFuture<'a, Result<Vec<Log>>> {
        Box::pin(self.logs(query))
    }
}

impl EthRpcClient {
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        Self::with_options(url, RpcClientOptions::default())
    }

    pub fn with_options(url: impl AsRef<str>, options: RpcClientOptions) -> Result<Self> {
        Self::with_options_and_breaker(url, options, Arc::new(RpcCircuitBreaker::default()))
    }

    pub fn with_options_and_breaker(
        url: impl AsRef<str>,
        options: RpcClientOptions,
        breaker: Arc<RpcCircuitBreaker>,
    ) -> Result<Self> {
        options.validate()?;

        let (endpoint, headers) = endpoint_with_auth(url.as_ref())?;
        let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_response_size(max_response_body_size)
            .build(&endpoint)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            endpoint: Arc::new(endpoint),
            client,
            options,
            metrics: Arc::new(RpcMetrics::default()),
            breaker,
        })
    }

    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        Self::with_options(config.rpc_url(), RpcClientOptions::from_config(config))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot(self.breaker.snapshot().state)
    }

    pub async fn latest_head(&self) -> Result<Head> {
        let context = RetryContext::new("eth_getBlockByNumber", &QUERY_RETRY);
        let block: Option<WireBlock> = self.call(context, rpc_params!["latest", false]).await?;
        block
            .map(Head::from)
            .context("node returned no block for the latest tag")
    }

    pub async fn head_by_number(&self, number: u64) -> Result<Option<Head>> {
        let context = RetryContext::new("eth_getBlockByNumber", &QUERY_RETRY)
            .about(RetrySubject::Block(number));
        let block: Option<WireBlock> = self
            .call(context, rpc_params![U64::from(number), false])
            .await?;
        Ok(block.map(Head::from))
    }

    pub async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        let context = RetryContext::new("eth_sendRawTransaction", &SUBMIT_RETRY);
        self.call(context, rpc_params![raw]).await
    }

    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>> {
        let context = RetryContext::new("eth_getTransactionReceipt", &QUERY_RETRY)
            .about(RetrySubject::Tx(hash));
        let receipt: Option<WireReceipt> = self.call(context, rpc_params![hash]).await?;
        Ok(receipt.and_then(WireReceipt::into_receipt))
    }

    pub async fn transaction_count(&self, address: Address) -> Result<u64> {
        let context = RetryContext::new("eth_getTransactionCount", &QUERY_RETRY)
            .about(RetrySubject::Account(address));
        let count: U64 = self.call(context, rpc_params![address, "pending"]).await?;
        Ok(count.to::<u64>())
    }

    pub async fn logs(&self, query: &LogQuery) -> Result<Vec<Log>> {
        let context = RetryContext::new("eth_getLogs", &QUERY_RETRY).about(RetrySubject::Range {
            from: query.from_block,
            to: query.to_block,
        });
        let logs: Vec<WireLog> = self
            .call(context, rpc_params![WireLogQuery::from(query)])
            .await?;
        Ok(logs.into_iter().filter_map(WireLog::into_log).collect())
    }

    async fn call<R>(&self, context: RetryContext<'_>, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        self.retry_with_breaker(context, || self.request_once(context.method, params.clone()))
            .await
    }

    async fn request_once<R>(&self, method: &'static str, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        timeout(
            self.options.request_timeout,
            self.client.request(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| map_rpc_error(method, err))
    }

    /// Breaker gating, metrics, exponential backoff, and logging around one
    /// logical RPC call. Node rejections are returned immediately.
    async fn retry_with_breaker<T, F, Fut>(
        &self,
        context: RetryContext<'_>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match self.breaker.before_request() {
                Ok(state) => context.log_permit(state),
                Err(CircuitBreakerError::CircuitOpen) => {
                    context.log_circuit_open();
                    return Err(RpcError::CircuitOpen.into());
                }
            }

            attempt += 1;
            let start = Instant::now();

            let err = match operation().await {
                Ok(value) => {
                    self.metrics.record_success(start.elapsed());
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            let elapsed = start.elapsed();
            match err.downcast_ref::<RpcError>() {
                Some(RpcError::Rejected { code, message, .. }) => {
                    self.metrics.record_rejection(elapsed);
                    self.breaker.record_success();
                    context.log_rejected(*code, message);
                    return Err(err);
                }
                Some(RpcError::Timeout { .. }) => {
                    self.metrics.record_timeout(elapsed);
                    self.breaker.record_failure();
                    if attempt < self.options.max_attempts {
                        context.log_timeout(attempt, self.options.backoff_delay(attempt));
                    }
                }
                Some(RpcError::Transport { .. }) => {
                    self.metrics.record_failure(elapsed);
                    self.breaker.record_failure();
                }
                _ => {
                    self.metrics.record_failure(elapsed);
                    self.breaker.record_failure();
                    context.log_exhausted(attempt, &err);
                    return Err(err);
                }
            }

            if attempt >= self.options.max_attempts {
                context.log_exhausted(attempt, &err);
                return Err(err);
            }

            let backoff = self.options.backoff_delay(attempt);
            context.log_retry(attempt, backoff, &err);
            sleep(backoff).await;
        }
    }
}

fn map_rpc_error(method: &'static str, err: JsonRpcError) -> anyhow::Error {
    match err {
        JsonRpcError::Call(object) => RpcError::Rejected {
            method,
            code: object.code(),
            message: object.message().to_owned(),
        }
        .into(),
        JsonRpcError::RequestTimeout => RpcError::Timeout { method }.into(),
        JsonRpcError::Transport(inner) => {
            if response_too_large(inner.as_ref()) {
                RpcError::ResponseTooLarge { method }.into()
            } else {
                RpcError::Transport {
                    method,
                    message: inner.to_string(),
                }
                .into()
            }
        }
        other => anyhow!("rpc {method} call failed: {other}"),
    }
}

fn response_too_large(inner: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    match inner.downcast_ref::<HttpTransportError>() {
        Some(HttpTransportError::Http(HttpError::TooLarge)) => true,
        Some(HttpTransportError::RequestTooLarge) => true,
        _ => false,
    }
}
