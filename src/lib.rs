pub mod chain;
pub mod initiators;
pub mod jobs;
pub mod logs;
pub mod processor;
pub mod rpc;
pub mod runtime;
pub mod store;
pub mod txm;

pub use chain::{BlockRef, ChainClient, Head, Log, LogFilter, Receipt};
pub use initiators::external::{ExternalInitiator, ExternalInitiatorManager};
pub use initiators::Initiators;
pub use jobs::{
    BridgeResponse, BridgeType, CallbackError, JobRun, JobSpec, JobSpecError, JobSpecRequest,
    RunManager, RunRequest, RunStatus,
};
pub use logs::{LogBroadcaster, LogListener};
pub use processor::fanout::{HeadEvent, HeadFanout, HeadSubscriber};
pub use processor::head_tracker::HeadTracker;
pub use processor::reorg::{CanonicalChain, ReorgWindow};
pub use rpc::circuit_breaker::{CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker};
pub use rpc::{EthRpcClient, RpcClientOptions, RpcError};
pub use runtime::config::{NodeConfig, NodeConfigBuilder, NodeConfigParams};
pub use runtime::node::OracleNode;
pub use runtime::notify::{RunNotifier, TracingNotifier, WebhookNotifier};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{MemoryStore, Store};
pub use txm::{EthTx, TxAttempt, TxManager, TxSigner, TxState, UnsafeDevSigner};
