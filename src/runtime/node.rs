//! The assembled oracle node. [`OracleNode`] owns every component, wires
//! them to the head fan-out in a fixed order, and starts and stops the
//! background tasks that drive them.

use crate::chain::ChainClient;
use crate::initiators::external::{ExternalInitiator, ExternalInitiatorManager};
use crate::initiators::Initiators;
use crate::jobs::adapters::AdapterTable;
use crate::jobs::bridge::{BridgeResponse, BridgeType};
use crate::jobs::run::{JobRun, RunRequest};
use crate::jobs::runner::{CallbackError, RunManager, RunServices};
use crate::jobs::spec::{JobSpec, JobSpecRequest};
use crate::logs::LogBroadcaster;
use crate::processor::fanout::HeadFanout;
use crate::processor::head_tracker::HeadTracker;
use crate::processor::lifecycle::LifecycleHandles;
use crate::processor::listener::HeadListener;
use crate::processor::reorg::CanonicalChain;
use crate::rpc::EthRpcClient;
use crate::runtime::config::NodeConfig;
use crate::runtime::notify::{NotifierSet, RunNotifier, TracingNotifier, WebhookNotifier};
use crate::runtime::telemetry::{self, Telemetry};
use crate::store::{MemoryStore, Store};
use crate::txm::{TxManager, TxSigner};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

pub struct OracleNode {
    config: NodeConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    telemetry: Arc<Telemetry>,
    fanout: Arc<HeadFanout>,
    tracker: Arc<HeadTracker>,
    txm: Arc<TxManager>,
    broadcaster: Arc<LogBroadcaster>,
    runs: RunManager,
    initiators: Initiators,
    external: ExternalInitiatorManager,
    shutdown: CancellationToken,
    handles: Option<LifecycleHandles>,
    stopped: bool,
}

impl OracleNode {
    /// Builds a node against the JSON-RPC endpoint in `config`, backed by an
    /// in-memory store.
    pub fn connect(config: NodeConfig, signer: Arc<dyn TxSigner>) -> Result<Self> {
        let chain: Arc<dyn ChainClient> = Arc::new(
            EthRpcClient::from_config(&config).context("failed to build chain client")?,
        );
        Self::new(config, chain, Arc::new(MemoryStore::new()), signer)
    }

    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        signer: Arc<dyn TxSigner>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        let telemetry = Arc::new(Telemetry::default());
        let canonical = Arc::new(CanonicalChain::new(config.head_window()));
        let fanout = Arc::new(HeadFanout::new(config.subscriber_budget(), telemetry.clone()));
        let shutdown = CancellationToken::new();
        let tracker = Arc::new(
            HeadTracker::new(
                chain.clone(),
                store.clone(),
                canonical.clone(),
                fanout.clone(),
                telemetry.clone(),
                config.max_backfill_depth(),
            )
            .with_shutdown(shutdown.child_token()),
        );
        let txm = Arc::new(TxManager::new(
            chain.clone(),
            store.clone(),
            signer,
            canonical.clone(),
            telemetry.clone(),
            config.tx_manager_settings(),
        ));
        let broadcaster = Arc::new(LogBroadcaster::new(
            chain.clone(),
            canonical.clone(),
            telemetry.clone(),
            config.broadcaster_settings(),
        ));

        let mut notifier = NotifierSet::new().with(Arc::new(TracingNotifier));
        if let Some(url) = config.run_webhook_url() {
            notifier = notifier.with(Arc::new(WebhookNotifier::new(
                http.clone(),
                url.clone(),
                config.bridge_timeout(),
            )));
        }
        let notifier: Arc<dyn RunNotifier> = Arc::new(notifier);

        let runs = RunManager::new(
            RunServices {
                store: store.clone(),
                chain: chain.clone(),
                canonical,
                txm: txm.clone(),
                adapters: AdapterTable::standard(
                    http.clone(),
                    config.bridge_response_url().cloned(),
                ),
                notifier,
                telemetry: telemetry.clone(),
            },
            config.run_settings(),
        );

        let initiators = Initiators::new(
            runs.clone(),
            store.clone(),
            broadcaster.clone(),
            http.clone(),
            config.bridge_timeout(),
            shutdown.child_token(),
        );
        let external = ExternalInitiatorManager::new(
            store.clone(),
            runs.clone(),
            http,
            config.bridge_timeout(),
        );

        Ok(Self {
            config,
            store,
            chain,
            telemetry,
            fanout,
            tracker,
            txm,
            broadcaster,
            runs,
            initiators,
            external,
            shutdown,
            handles: None,
            stopped: false,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn head_fanout(&self) -> &Arc<HeadFanout> {
        &self.fanout
    }

    pub fn head_tracker(&self) -> &Arc<HeadTracker> {
        &self.tracker
    }

    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.txm
    }

    pub fn log_broadcaster(&self) -> &Arc<LogBroadcaster> {
        &self.broadcaster
    }

    pub fn runs(&self) -> &RunManager {
        &self.runs
    }

    pub fn initiators(&self) -> &Initiators {
        &self.initiators
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handles.is_some()
    }

    /// Seeds the tracker from persisted heads, registers the head
    /// subscribers and spawns the background tasks. Calling it on a running
    /// node is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        if self.stopped {
            bail!("a stopped node cannot be restarted");
        }

        let tip = self
            .tracker
            .start(self.config.head_window())
            .await
            .context("failed to seed head tracker")?;

        // Transactions settle before logs are delivered; runs see both.
        self.fanout.register(self.txm.clone());
        self.fanout.register(self.broadcaster.clone());
        self.fanout.register(Arc::new(self.runs.clone()));

        let mut handles = LifecycleHandles::new(&self.shutdown);
        for (name, handle) in self
            .runs
            .start(handles.run_token.clone())
            .await
            .context("failed to start run manager")?
        {
            handles.track(name, handle);
        }
        handles.track(
            "head_listener",
            HeadListener::spawn(
                self.chain.clone(),
                self.tracker.clone(),
                self.config.listener_settings(),
                handles.run_token.clone(),
            ),
        );
        handles.track(
            "metrics_reporter",
            telemetry::spawn_metrics_reporter(
                self.telemetry.clone(),
                handles.run_token.clone(),
                self.config.metrics_interval(),
            ),
        );

        let activated = self
            .initiators
            .activate_all()
            .await
            .context("failed to activate jobs")?;

        tracing::info!(
            tip = tip.as_ref().map(|head| head.number),
            subscribers = self.fanout.len(),
            tasks = handles.len(),
            jobs = activated,
            from = %self.config.from_address(),
            poll_interval = %humantime::format_duration(self.config.head_poll_interval()),
            "oracle node started"
        );
        self.handles = Some(handles);
        Ok(())
    }

    /// Cancels the root token, stops every initiator and joins the
    /// background tasks. Runs in flight finish their current step first.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handles) = self.handles.take() else {
            return Ok(());
        };

        self.shutdown.cancel();
        self.initiators.shutdown().await;
        handles.shutdown().await;
        self.runs.shutdown().await;
        self.stopped = true;
        tracing::info!("oracle node stopped");
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("oracle node running; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down oracle node");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("oracle node shutdown token cancelled");
            }
        }

        self.stop().await
    }

    /// Validates and stores a job, tells the external initiators it names
    /// about it, and starts its initiators. A job whose external initiator
    /// could not be notified is kept but paused.
    pub async fn create_job(&self, request: &JobSpecRequest) -> Result<JobSpec> {
        let mut job = self.runs.create_job(request).await?;
        if let Err(err) = self.external.notify_job(&job).await {
            tracing::warn!(job_id = %job.id, error = %err, "external initiator notification failed; pausing job");
            job.paused = true;
            self.store
                .save_job(&job)
                .await
                .context("failed to pause job")?;
            return Ok(job);
        }
        self.initiators.activate(&job);
        Ok(job)
    }

    pub async fn pause_job(&self, job_id: Uuid) -> Result<JobSpec> {
        let mut job = self.job(job_id).await?;
        job.paused = true;
        self.store.save_job(&job).await.context("failed to pause job")?;
        self.initiators.deactivate(job_id);
        tracing::info!(%job_id, "job paused");
        Ok(job)
    }

    pub async fn resume_job(&self, job_id: Uuid) -> Result<JobSpec> {
        let mut job = self.job(job_id).await?;
        job.paused = false;
        self.store.save_job(&job).await.context("failed to resume job")?;
        self.initiators.activate(&job);
        tracing::info!(%job_id, "job resumed");
        Ok(job)
    }

    /// Manually starts a run of a job with a web initiator.
    pub async fn create_web_run(&self, job_id: Uuid, params: Value) -> Result<JobRun> {
        let job = self.job(job_id).await?;
        if !job.has_initiator("web") {
            bail!("job {job_id} has no web initiator");
        }
        self.runs.create_run(job_id, RunRequest::web(params)).await
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> Result<JobRun> {
        self.runs.cancel(run_id).await
    }

    /// Completes (or keeps parked) the bridge task a run is waiting on.
    pub async fn bridge_callback(
        &self,
        run_id: Uuid,
        token: &str,
        response: BridgeResponse,
    ) -> Result<JobRun, CallbackError> {
        self.runs.resume_bridge(run_id, token, response).await
    }

    pub async fn register_bridge(&self, bridge: BridgeType) -> Result<BridgeType> {
        if self.store.bridge(&bridge.name).await?.is_some() {
            bail!("bridge {} already exists", bridge.name);
        }
        self.store
            .save_bridge(&bridge)
            .await
            .context("failed to persist bridge")?;
        tracing::info!(bridge = %bridge.name, url = %bridge.url, "bridge registered");
        Ok(bridge)
    }

    pub async fn register_external_initiator(
        &self,
        name: &str,
        url: Option<Url>,
    ) -> Result<ExternalInitiator> {
        self.external.register(name, url).await
    }

    /// Starts a run on behalf of an authenticated external initiator.
    pub async fn trigger_external(
        &self,
        access_key: &str,
        secret: &str,
        job_id: Uuid,
        params: Value,
    ) -> Result<JobRun> {
        self.external
            .trigger(access_key, secret, job_id, params)
            .await
    }

    async fn job(&self, job_id: Uuid) -> Result<JobSpec> {
        self.store
            .job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} does not exist"))
    }
}
