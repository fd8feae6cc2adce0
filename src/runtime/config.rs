use crate::jobs::runner::RunSettings;
use crate::logs::BroadcasterSettings;
use crate::processor::listener::ListenerSettings;
use crate::runtime::telemetry;
use crate::txm::TxManagerSettings;
use alloy_primitives::{Address, U256};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use url::Url;

const GWEI: u64 = 1_000_000_000;

const DEFAULT_HEAD_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_MAX_BACKFILL_DEPTH: u64 = 64;
const DEFAULT_HEAD_WINDOW: usize = 256;
const DEFAULT_SUBSCRIBER_BUDGET_SECS: u64 = 10;
const DEFAULT_MIN_INCOMING_CONFIRMATIONS: u64 = 3;
const DEFAULT_MIN_OUTGOING_CONFIRMATIONS: u64 = 12;
const DEFAULT_GAS_BUMP_THRESHOLD: u64 = 3;
const DEFAULT_GAS_BUMP_PERCENT: u64 = 20;
const DEFAULT_GAS_BUMP_MIN_GWEI: u64 = 5;
const DEFAULT_GAS_PRICE_GWEI: u64 = 20;
const DEFAULT_MAX_GAS_PRICE_GWEI: u64 = 1_500;
const DEFAULT_GAS_LIMIT: u64 = 500_000;
const DEFAULT_LOG_BACKFILL_BLOCKS: u64 = 1_000;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BRIDGE_TIMEOUT_SECS: u64 = 15;
const RECONNECT_INITIAL_MS: u64 = 500;
const RECONNECT_MAX_SECS: u64 = 30;

/// Runtime configuration for an oracle node.
///
/// All instances must be constructed via [`NodeConfig::builder`] or [`NodeConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    rpc_url: String,
    chain_id: u64,
    from_address: Address,
    head_poll_interval: Duration,
    max_backfill_depth: u64,
    head_window: usize,
    subscriber_budget: Duration,
    min_incoming_confirmations: u64,
    min_outgoing_confirmations: u64,
    gas_bump_threshold: u64,
    gas_bump_percent: u64,
    gas_bump_min: U256,
    default_gas_price: U256,
    max_gas_price: U256,
    default_gas_limit: u64,
    log_backfill_blocks: u64,
    rpc_timeout: Duration,
    metrics_interval: Duration,
    bridge_timeout: Duration,
    bridge_response_url: Option<Url>,
    run_webhook_url: Option<Url>,
}

pub struct NodeConfigParams {
    pub rpc_url: String,
    pub chain_id: u64,
    pub from_address: Address,
    pub head_poll_interval: Duration,
    pub max_backfill_depth: u64,
    pub head_window: usize,
    pub subscriber_budget: Duration,
    pub min_incoming_confirmations: u64,
    pub min_outgoing_confirmations: u64,
    pub gas_bump_threshold: u64,
    pub gas_bump_percent: u64,
    pub gas_bump_min: U256,
    pub default_gas_price: U256,
    pub max_gas_price: U256,
    pub default_gas_limit: u64,
    pub log_backfill_blocks: u64,
    pub rpc_timeout: Duration,
    pub metrics_interval: Duration,
    pub bridge_timeout: Duration,
    pub bridge_response_url: Option<Url>,
    pub run_webhook_url: Option<Url>,
}

impl NodeConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`NodeConfig::builder`] when most values use defaults.
    pub fn new(params: NodeConfigParams) -> Result<Self> {
        let NodeConfigParams {
            rpc_url,
            chain_id,
            from_address,
            head_poll_interval,
            max_backfill_depth,
            head_window,
            subscriber_budget,
            min_incoming_confirmations,
            min_outgoing_confirmations,
            gas_bump_threshold,
            gas_bump_percent,
            gas_bump_min,
            default_gas_price,
            max_gas_price,
            default_gas_limit,
            log_backfill_blocks,
            rpc_timeout,
            metrics_interval,
            bridge_timeout,
            bridge_response_url,
            run_webhook_url,
        } = params;

        let config = Self {
            rpc_url: rpc_url.trim().to_owned(),
            chain_id,
            from_address,
            head_poll_interval,
            max_backfill_depth,
            head_window,
            subscriber_budget,
            min_incoming_confirmations,
            min_outgoing_confirmations,
            gas_bump_threshold,
            gas_bump_percent,
            gas_bump_min,
            default_gas_price,
            max_gas_price,
            default_gas_limit,
            log_backfill_blocks,
            rpc_timeout,
            metrics_interval,
            bridge_timeout,
            bridge_response_url,
            run_webhook_url,
        };

        config.validate()?;
        Ok(config)
    }

    /// JSON-RPC endpoint of the chain node, including scheme.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Account every outgoing transaction is sent from.
    pub fn from_address(&self) -> Address {
        self.from_address
    }

    pub fn head_poll_interval(&self) -> Duration {
        self.head_poll_interval
    }

    /// Deepest gap the head tracker fills before reseeding.
    pub fn max_backfill_depth(&self) -> u64 {
        self.max_backfill_depth
    }

    /// Number of canonical heads kept for reorg detection.
    pub fn head_window(&self) -> usize {
        self.head_window
    }

    /// Time each head subscriber gets before the fan-out moves on.
    pub fn subscriber_budget(&self) -> Duration {
        self.subscriber_budget
    }

    pub fn min_incoming_confirmations(&self) -> u64 {
        self.min_incoming_confirmations
    }

    pub fn min_outgoing_confirmations(&self) -> u64 {
        self.min_outgoing_confirmations
    }

    /// Blocks an attempt may stay unconfirmed before its gas price is bumped.
    pub fn gas_bump_threshold(&self) -> u64 {
        self.gas_bump_threshold
    }

    pub fn gas_bump_percent(&self) -> u64 {
        self.gas_bump_percent
    }

    /// Smallest absolute bump in wei.
    pub fn gas_bump_min(&self) -> U256 {
        self.gas_bump_min
    }

    pub fn default_gas_price(&self) -> U256 {
        self.default_gas_price
    }

    pub fn max_gas_price(&self) -> U256 {
        self.max_gas_price
    }

    pub fn default_gas_limit(&self) -> u64 {
        self.default_gas_limit
    }

    /// Widest block range the log broadcaster pulls for one head.
    pub fn log_backfill_blocks(&self) -> u64 {
        self.log_backfill_blocks
    }

    /// Per-RPC timeout applied to the JSON-RPC client.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Interval between runtime metrics snapshots.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Timeout for bridge, price feed and external initiator calls.
    pub fn bridge_timeout(&self) -> Duration {
        self.bridge_timeout
    }

    /// URL bridges call back on to complete a pending task.
    pub fn bridge_response_url(&self) -> Option<&Url> {
        self.bridge_response_url.as_ref()
    }

    pub fn run_webhook_url(&self) -> Option<&Url> {
        self.run_webhook_url.as_ref()
    }

    pub fn tx_manager_settings(&self) -> TxManagerSettings {
        TxManagerSettings {
            chain_id: self.chain_id,
            default_gas_price: self.default_gas_price,
            max_gas_price: self.max_gas_price,
            gas_bump_threshold: self.gas_bump_threshold,
            gas_bump_percent: self.gas_bump_percent,
            gas_bump_min: self.gas_bump_min,
            min_outgoing_confirmations: self.min_outgoing_confirmations,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            min_incoming_confirmations: self.min_incoming_confirmations,
            min_outgoing_confirmations: self.min_outgoing_confirmations,
            from_address: self.from_address,
            default_gas_limit: self.default_gas_limit,
        }
    }

    pub fn broadcaster_settings(&self) -> BroadcasterSettings {
        BroadcasterSettings {
            log_backfill_blocks: self.log_backfill_blocks,
            call_budget: self.subscriber_budget,
        }
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            poll_interval: self.head_poll_interval,
            reconnect_initial: Duration::from_millis(RECONNECT_INITIAL_MS)
                .min(self.head_poll_interval),
            reconnect_max: Duration::from_secs(RECONNECT_MAX_SECS),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            bail!("rpc_url cannot be empty");
        }
        validate_url(&self.rpc_url)?;
        if self.chain_id == 0 {
            bail!("chain_id must be greater than 0");
        }
        if self.from_address == Address::ZERO {
            bail!("from_address cannot be the zero address");
        }
        if self.head_poll_interval.is_zero() {
            bail!("head_poll_interval must be greater than 0");
        }
        if self.max_backfill_depth == 0 {
            bail!("max_backfill_depth must be greater than 0");
        }
        if self.head_window == 0 {
            bail!("head_window must be greater than 0");
        }
        if (self.head_window as u64) < self.min_outgoing_confirmations {
            bail!("head_window must cover min_outgoing_confirmations");
        }
        if self.subscriber_budget.is_zero() {
            bail!("subscriber_budget must be greater than 0");
        }
        if self.gas_bump_threshold == 0 {
            bail!("gas_bump_threshold must be greater than 0");
        }
        if self.gas_bump_percent == 0 && self.gas_bump_min.is_zero() {
            bail!("gas_bump_percent and gas_bump_min cannot both be 0");
        }
        if self.default_gas_price.is_zero() {
            bail!("default_gas_price must be greater than 0");
        }
        if self.max_gas_price < self.default_gas_price {
            bail!("max_gas_price must not be lower than default_gas_price");
        }
        if self.default_gas_limit == 0 {
            bail!("default_gas_limit must be greater than 0");
        }
        if self.log_backfill_blocks == 0 {
            bail!("log_backfill_blocks must be greater than 0");
        }
        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }
        if self.bridge_timeout.is_zero() {
            bail!("bridge_timeout must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Default, Debug, Clone)]
pub struct NodeConfigBuilder {
    rpc_url: Option<String>,
    chain_id: Option<u64>,
    from_address: Option<Address>,
    head_poll_interval: Option<Duration>,
    max_backfill_depth: Option<u64>,
    head_window: Option<usize>,
    subscriber_budget: Option<Duration>,
    min_incoming_confirmations: Option<u64>,
    min_outgoing_confirmations: Option<u64>,
    gas_bump_threshold: Option<u64>,
    gas_bump_percent: Option<u64>,
    gas_bump_min: Option<U256>,
    default_gas_price: Option<U256>,
    max_gas_price: Option<U256>,
    default_gas_limit: Option<u64>,
    log_backfill_blocks: Option<u64>,
    rpc_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    bridge_timeout: Option<Duration>,
    bridge_response_url: Option<Url>,
    run_webhook_url: Option<Url>,
}

impl NodeConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn from_address(mut self, address: Address) -> Self {
        self.from_address = Some(address);
        self
    }

    pub fn head_poll_interval(mut self, interval: Duration) -> Self {
        self.head_poll_interval = Some(interval);
        self
    }

    pub fn max_backfill_depth(mut self, depth: u64) -> Self {
        self.max_backfill_depth = Some(depth);
        self
    }

    pub fn head_window(mut self, window: usize) -> Self {
        self.head_window = Some(window);
        self
    }

    pub fn subscriber_budget(mut self, budget: Duration) -> Self {
        self.subscriber_budget = Some(budget);
        self
    }

    pub fn min_incoming_confirmations(mut self, confirmations: u64) -> Self {
        self.min_incoming_confirmations = Some(confirmations);
        self
    }

    pub fn min_outgoing_confirmations(mut self, confirmations: u64) -> Self {
        self.min_outgoing_confirmations = Some(confirmations);
        self
    }

    pub fn gas_bump_threshold(mut self, blocks: u64) -> Self {
        self.gas_bump_threshold = Some(blocks);
        self
    }

    pub fn gas_bump_percent(mut self, percent: u64) -> Self {
        self.gas_bump_percent = Some(percent);
        self
    }

    pub fn gas_bump_min(mut self, wei: U256) -> Self {
        self.gas_bump_min = Some(wei);
        self
    }

    pub fn default_gas_price(mut self, wei: U256) -> Self {
        self.default_gas_price = Some(wei);
        self
    }

    pub fn max_gas_price(mut self, wei: U256) -> Self {
        self.max_gas_price = Some(wei);
        self
    }

    pub fn default_gas_limit(mut self, gas: u64) -> Self {
        self.default_gas_limit = Some(gas);
        self
    }

    pub fn log_backfill_blocks(mut self, blocks: u64) -> Self {
        self.log_backfill_blocks = Some(blocks);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn bridge_timeout(mut self, timeout: Duration) -> Self {
        self.bridge_timeout = Some(timeout);
        self
    }

    pub fn bridge_response_url(mut self, url: Url) -> Self {
        self.bridge_response_url = Some(url);
        self
    }

    pub fn run_webhook_url(mut self, url: Url) -> Self {
        self.run_webhook_url = Some(url);
        self
    }

    pub fn build(self) -> Result<NodeConfig> {
        let params = NodeConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            chain_id: self.chain_id.context("chain_id is required")?,
            from_address: self.from_address.context("from_address is required")?,
            head_poll_interval: self
                .head_poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_HEAD_POLL_INTERVAL_SECS)),
            max_backfill_depth: self.max_backfill_depth.unwrap_or(DEFAULT_MAX_BACKFILL_DEPTH),
            head_window: self.head_window.unwrap_or(DEFAULT_HEAD_WINDOW),
            subscriber_budget: self
                .subscriber_budget
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SUBSCRIBER_BUDGET_SECS)),
            min_incoming_confirmations: self
                .min_incoming_confirmations
                .unwrap_or(DEFAULT_MIN_INCOMING_CONFIRMATIONS),
            min_outgoing_confirmations: self
                .min_outgoing_confirmations
                .unwrap_or(DEFAULT_MIN_OUTGOING_CONFIRMATIONS),
            gas_bump_threshold: self.gas_bump_threshold.unwrap_or(DEFAULT_GAS_BUMP_THRESHOLD),
            gas_bump_percent: self.gas_bump_percent.unwrap_or(DEFAULT_GAS_BUMP_PERCENT),
            gas_bump_min: self
                .gas_bump_min
                .unwrap_or_else(|| gwei(DEFAULT_GAS_BUMP_MIN_GWEI)),
            default_gas_price: self
                .default_gas_price
                .unwrap_or_else(|| gwei(DEFAULT_GAS_PRICE_GWEI)),
            max_gas_price: self
                .max_gas_price
                .unwrap_or_else(|| gwei(DEFAULT_MAX_GAS_PRICE_GWEI)),
            default_gas_limit: self.default_gas_limit.unwrap_or(DEFAULT_GAS_LIMIT),
            log_backfill_blocks: self
                .log_backfill_blocks
                .unwrap_or(DEFAULT_LOG_BACKFILL_BLOCKS),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            bridge_timeout: self
                .bridge_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_BRIDGE_TIMEOUT_SECS)),
            bridge_response_url: self.bridge_response_url,
            run_webhook_url: self.run_webhook_url,
        };

        NodeConfig::new(params)
    }
}

pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(GWEI)
}

fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
