//! The job-run state machine. Runs advance task by task until one suspends,
//! fails, or the pipeline completes. Suspended runs hold no task; they are
//! found again by status on the next head, by id on a bridge callback, or by
//! the deadline queue when a sleep expires.

use crate::chain::ChainClient;
use crate::jobs::adapters::{result_bytes, AdapterTable, TaskInput, TaskOutcome};
use crate::jobs::bridge::BridgeResponse;
use crate::jobs::run::{JobRun, ResumeEvent, RunRequest, RunStatus, Suspension};
use crate::jobs::spec::{JobSpec, JobSpecError, JobSpecRequest, TaskKind};
use crate::jobs::timers::DeadlineQueue;
use crate::processor::fanout::{HeadEvent, HeadSubscriber};
use crate::processor::reorg::CanonicalChain;
use crate::rpc::is_transient;
use crate::runtime::notify::RunNotifier;
use crate::runtime::telemetry::Telemetry;
use crate::store::Store;
use crate::txm::{NewTx, TxManager, TxOwner, TxProgress};
use alloy_primitives::{Address, Bytes, U256};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Incoming confirmations every log-initiated task waits for.
    pub min_incoming_confirmations: u64,
    /// Depth a transaction must reach before its task completes.
    pub min_outgoing_confirmations: u64,
    pub from_address: Address,
    pub default_gas_limit: u64,
}

/// Collaborators the run manager drives.
pub struct RunServices {
    pub store: Arc<dyn Store>,
    pub chain: Arc<dyn ChainClient>,
    pub canonical: Arc<CanonicalChain>,
    pub txm: Arc<TxManager>,
    pub adapters: AdapterTable,
    pub notifier: Arc<dyn RunNotifier>,
    pub telemetry: Arc<Telemetry>,
}

/// Why a bridge callback was refused.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("run {0} does not exist")]
    UnknownRun(Uuid),
    #[error("run {run_id} is {status:?}, not waiting on a bridge")]
    NotPendingBridge { run_id: Uuid, status: RunStatus },
    #[error("callback for task run {task_run_id} arrived after run {run_id} moved on")]
    StaleCallback { run_id: Uuid, task_run_id: Uuid },
    #[error("callback token does not match the bridge")]
    Unauthorized,
    #[error("callback failed: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for CallbackError {
    fn from(err: anyhow::Error) -> Self {
        CallbackError::Internal(format!("{err:#}"))
    }
}

enum Step {
    Continue,
    Suspend(Suspension),
    Fail(String),
}

struct Inner {
    services: RunServices,
    settings: RunSettings,
    runs: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    timers: RwLock<Option<DeadlineQueue>>,
    tracker: TaskTracker,
}

#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl RunManager {
    pub fn new(services: RunServices, settings: RunSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                settings,
                runs: Mutex::new(HashMap::new()),
                timers: RwLock::new(None),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.inner.settings
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.inner.services.store
    }

    /// Validates and persists a job. Task types must be built in or name a
    /// registered bridge; external initiators must already be registered.
    pub async fn create_job(&self, request: &JobSpecRequest) -> Result<JobSpec> {
        let bridges: HashSet<String> = self.store().bridge_names().await?.into_iter().collect();
        let job = JobSpec::parse(request, &bridges)?;
        for (name, _) in job.external_initiators() {
            if self.store().external_initiator(name).await?.is_none() {
                return Err(JobSpecError::UnknownExternalInitiator(name.to_owned()).into());
            }
        }
        self.store()
            .save_job(&job)
            .await
            .context("failed to persist job")?;
        tracing::info!(
            job_id = %job.id,
            initiators = job.initiators.len(),
            tasks = job.tasks.len(),
            "job created"
        );
        Ok(job)
    }

    /// Creates a run and executes it until it suspends or finishes.
    pub async fn create_run(&self, job_id: Uuid, request: RunRequest) -> Result<JobRun> {
        let run = self.new_run(job_id, request).await?;
        let _guard = self.lock_run(run.id).await;
        let mut run = run;
        self.advance(&mut run).await?;
        Ok(run)
    }

    /// Creates a run and executes it in the background. Returns the run as
    /// persisted before its first task.
    pub async fn spawn_run(&self, job_id: Uuid, request: RunRequest) -> Result<JobRun> {
        let run = self.new_run(job_id, request).await?;
        self.spawn_execute(run.id);
        Ok(run)
    }

    async fn new_run(&self, job_id: Uuid, request: RunRequest) -> Result<JobRun> {
        let job = self
            .store()
            .job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} does not exist"))?;
        if !job.is_active_at(Utc::now()) {
            bail!("job {job_id} is not active");
        }

        let run = JobRun::new(
            &job,
            request,
            self.inner.services.canonical.tip_number(),
        );
        self.store()
            .save_run(&run)
            .await
            .context("failed to persist run")?;
        self.inner.services.telemetry.record_run_created();
        tracing::info!(
            run_id = %run.id,
            job_id = %job_id,
            initiator = %run.request.initiator,
            creation_height = ?run.creation_height,
            "run created"
        );
        Ok(run)
    }

    fn spawn_execute(&self, run_id: Uuid) {
        let manager = self.clone();
        self.inner.tracker.spawn(async move {
            if let Err(err) = manager.execute(run_id).await {
                tracing::error!(%run_id, error = %err, "run execution failed");
            }
        });
    }

    /// Advances a run that is not parked on anything.
    async fn execute(&self, run_id: Uuid) -> Result<()> {
        let _guard = self.lock_run(run_id).await;
        let Some(mut run) = self.store().run(run_id).await? else {
            bail!("run {run_id} disappeared before execution");
        };
        if run.status.is_terminal() || run.suspension.is_some() {
            return Ok(());
        }
        self.advance(&mut run).await
    }

    /// Re-checks a parked run against `event`. Events the run is not waiting
    /// on, and events for finished runs, leave it untouched.
    pub async fn resume(&self, run_id: Uuid, event: ResumeEvent) -> Result<Option<JobRun>> {
        let _guard = self.lock_run(run_id).await;
        let Some(mut run) = self.store().run(run_id).await? else {
            return Ok(None);
        };
        let awaited = run
            .suspension
            .as_ref()
            .map(|suspension| suspension.awaits(&event))
            .unwrap_or(false);
        if run.status.is_terminal() || !awaited {
            return Ok(Some(run));
        }
        self.advance(&mut run).await?;
        Ok(Some(run))
    }

    /// Applies a bridge callback to the run parked on it. `token` must be the
    /// bridge's outgoing token.
    pub async fn resume_bridge(
        &self,
        run_id: Uuid,
        token: &str,
        response: BridgeResponse,
    ) -> Result<JobRun, CallbackError> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self
            .store()
            .run(run_id)
            .await?
            .ok_or(CallbackError::UnknownRun(run_id))?;

        let Some(suspension @ Suspension::Bridge {
            task_index,
            task_run_id,
        }) = run.suspension.clone()
        else {
            return Err(CallbackError::NotPendingBridge {
                run_id,
                status: run.status,
            });
        };
        if let Some(answered) = response.task_run_id {
            if !suspension.awaits(&ResumeEvent::BridgeCallback {
                task_run_id: answered,
            }) {
                tracing::debug!(%run_id, %answered, waiting_on = %task_run_id, "stale bridge callback");
                return Err(CallbackError::StaleCallback {
                    run_id,
                    task_run_id: answered,
                });
            }
        }
        let TaskKind::Bridge { name, .. } = &run.task_runs[task_index].task.kind else {
            return Err(CallbackError::Internal(format!(
                "task {task_index} of run {run_id} is not a bridge task"
            )));
        };
        let bridge = self
            .store()
            .bridge(name)
            .await?
            .ok_or_else(|| CallbackError::Internal(format!("bridge {name} is no longer registered")))?;
        if token != bridge.outgoing_token {
            tracing::warn!(%run_id, bridge = %bridge.name, "bridge callback with wrong token");
            return Err(CallbackError::Unauthorized);
        }

        match response.into_outcome() {
            TaskOutcome::Pending => {
                tracing::debug!(%run_id, %task_run_id, "bridge callback still pending");
                return Ok(run);
            }
            TaskOutcome::Errored(reason) => {
                run.fail(Some(task_index), reason);
                self.persist(&run).await?;
            }
            TaskOutcome::Completed { result, data } => {
                merge_data(&mut run.data, data);
                run.complete_task(task_index, result);
                tracing::info!(%run_id, %task_run_id, "bridge callback resumed run");
                self.advance(&mut run).await?;
            }
        }
        Ok(run)
    }

    /// Cancels a run from any non-terminal state. Transactions already
    /// broadcast keep being tracked; the run simply stops consuming them.
    pub async fn cancel(&self, run_id: Uuid) -> Result<JobRun> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self
            .store()
            .run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run {run_id} does not exist"))?;
        if run.status.is_terminal() {
            bail!("run {run_id} already finished as {:?}", run.status);
        }
        run.cancel();
        self.persist(&run).await?;
        Ok(run)
    }

    /// Picks up runs interrupted by a restart: unparked runs are executed
    /// again and sleeping runs get their deadlines re-armed. Head- and
    /// callback-driven runs need nothing; they are found by status.
    pub async fn recover(&self) -> Result<usize> {
        let interrupted = self
            .store()
            .runs_with_status(&[RunStatus::Unstarted, RunStatus::InProgress])
            .await?;
        let sleeping = self
            .store()
            .runs_with_status(&[RunStatus::PendingSleep])
            .await?;

        for run in &interrupted {
            self.spawn_execute(run.id);
        }
        for run in &sleeping {
            if let Some(Suspension::Sleep { until, .. }) = &run.suspension {
                self.arm_timer(run.id, *until);
            }
        }

        let recovered = interrupted.len() + sleeping.len();
        if recovered > 0 {
            tracing::info!(
                interrupted = interrupted.len(),
                sleeping = sleeping.len(),
                "recovered runs"
            );
        }
        Ok(recovered)
    }

    /// Starts the deadline queue and the task that resumes expired sleeps,
    /// then recovers interrupted runs.
    pub async fn start(
        &self,
        shutdown: CancellationToken,
    ) -> Result<Vec<(&'static str, JoinHandle<()>)>> {
        let (fired_tx, mut fired) = mpsc::unbounded_channel::<Uuid>();
        let (queue, queue_handle) = DeadlineQueue::spawn(fired_tx, shutdown.clone());
        *self
            .inner
            .timers
            .write()
            .expect("deadline queue slot poisoned") = Some(queue);

        let manager = self.clone();
        let resumer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    run_id = fired.recv() => {
                        let Some(run_id) = run_id else { break };
                        let worker = manager.clone();
                        manager.inner.tracker.spawn(async move {
                            let event = ResumeEvent::Timer { now: Utc::now() };
                            if let Err(err) = worker.resume(run_id, event).await {
                                tracing::warn!(%run_id, error = %err, "failed to resume sleeping run");
                            }
                        });
                    }
                }
            }
        });

        self.recover().await?;
        Ok(vec![("deadline_queue", queue_handle), ("sleep_resumer", resumer)])
    }

    /// Waits for background executions to finish.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    async fn lock_run(&self, run_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .runs
            .lock()
            .expect("run lock registry poisoned")
            .entry(run_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn arm_timer(&self, run_id: Uuid, until: DateTime<Utc>) {
        match self
            .inner
            .timers
            .read()
            .expect("deadline queue slot poisoned")
            .as_ref()
        {
            Some(queue) => queue.arm(run_id, until),
            None => tracing::warn!(%run_id, %until, "deadline queue not started; sleep armed on recovery"),
        }
    }

    fn disarm_timer(&self, run_id: Uuid) {
        if let Some(queue) = self
            .inner
            .timers
            .read()
            .expect("deadline queue slot poisoned")
            .as_ref()
        {
            queue.disarm(run_id);
        }
    }

    /// Runs tasks in order until the run suspends or finishes, then persists
    /// it. Callers hold the run's lock.
    async fn advance(&self, run: &mut JobRun) -> Result<()> {
        loop {
            let Some(index) = run.next_task_index() else {
                run.complete();
                break;
            };

            run.status = RunStatus::InProgress;
            run.task_runs[index].status = RunStatus::InProgress;
            match self.step(run, index).await? {
                Step::Continue => continue,
                Step::Suspend(suspension) => {
                    if let Suspension::Sleep { until, .. } = &suspension {
                        self.arm_timer(run.id, *until);
                    }
                    tracing::debug!(run_id = %run.id, task_index = index, status = ?suspension.status(), "run suspended");
                    run.suspend(suspension);
                    break;
                }
                Step::Fail(reason) => {
                    run.fail(Some(index), reason);
                    break;
                }
            }
        }
        self.persist(run).await
    }

    async fn persist(&self, run: &JobRun) -> Result<()> {
        self.store()
            .save_run(run)
            .await
            .with_context(|| format!("failed to persist run {}", run.id))?;
        if !run.status.is_terminal() {
            return Ok(());
        }

        let telemetry = &self.inner.services.telemetry;
        match run.status {
            RunStatus::Completed => telemetry.record_run_completed(),
            RunStatus::Cancelled => telemetry.record_run_cancelled(),
            _ => telemetry.record_run_errored(),
        }
        self.disarm_timer(run.id);
        self.inner.services.notifier.run_finished(run).await;
        self.inner
            .runs
            .lock()
            .expect("run lock registry poisoned")
            .remove(&run.id);
        Ok(())
    }

    async fn step(&self, run: &mut JobRun, index: usize) -> Result<Step> {
        if let Some(step) = self.incoming_gate(run, index).await? {
            return Ok(step);
        }

        let kind = run.task_runs[index].task.kind.clone();
        match kind {
            TaskKind::EthTx {
                address,
                function_selector,
                data_prefix,
                gas_limit,
            } => {
                let payload = EthTxPayload {
                    address,
                    function_selector,
                    data_prefix,
                    gas_limit,
                };
                self.eth_tx(run, index, payload).await
            }
            TaskKind::Sleep { until } => {
                if Utc::now() >= until {
                    let result = run.prior_result(index);
                    run.complete_task(index, result);
                    Ok(Step::Continue)
                } else {
                    Ok(Step::Suspend(Suspension::Sleep {
                        task_index: index,
                        until,
                    }))
                }
            }
            kind => self.perform(run, index, &kind).await,
        }
    }

    /// Holds a task until enough blocks sit on top of the run's triggering
    /// log (or its creation height), and checks once that the log's
    /// transaction still lives in the block the log claimed.
    async fn incoming_gate(&self, run: &mut JobRun, index: usize) -> Result<Option<Step>> {
        if run.task_runs[index].confirmations_satisfied {
            return Ok(None);
        }
        let required = self.required_incoming(run, index).await?;
        let has_log = run.request.log.is_some();
        if required == 0 && (!has_log || run.log_validated) {
            run.task_runs[index].confirmations_satisfied = true;
            return Ok(None);
        }

        let tip = self.inner.services.canonical.tip_number();
        if run.creation_height.is_none() {
            run.creation_height = tip;
        }
        let base = run
            .request
            .log
            .as_ref()
            .map(|log| log.block_number)
            .or(run.creation_height);
        let observed = match (tip, base) {
            (Some(tip), Some(base)) => tip.saturating_sub(base),
            _ => 0,
        };
        run.task_runs[index].observed_confirmations = observed;

        let waiting = Step::Suspend(Suspension::IncomingConfirmations {
            task_index: index,
            required,
        });
        if observed < required {
            return Ok(Some(waiting));
        }

        if let (Some(log), false) = (run.request.log.as_ref(), run.log_validated) {
            match self
                .inner
                .services
                .chain
                .transaction_receipt(log.tx_hash)
                .await
            {
                Ok(Some(receipt)) if receipt.block_hash == log.block_hash => {
                    run.log_validated = true;
                }
                Ok(Some(receipt)) => {
                    tracing::warn!(
                        run_id = %run.id,
                        tx_hash = %log.tx_hash,
                        log_block = %log.block_hash,
                        receipt_block = %receipt.block_hash,
                        "run log block was orphaned"
                    );
                    return Ok(Some(Step::Fail(format!(
                        "log block {} was orphaned; transaction now in block {}",
                        log.block_hash, receipt.block_hash
                    ))));
                }
                Ok(None) => {
                    return Ok(Some(Step::Fail(format!(
                        "receipt for run log transaction {} not found",
                        log.tx_hash
                    ))));
                }
                Err(err) if is_transient(&err) => {
                    tracing::debug!(run_id = %run.id, error = %err, "receipt check deferred");
                    return Ok(Some(waiting));
                }
                Err(err) => {
                    return Ok(Some(Step::Fail(format!(
                        "failed to validate run log: {err:#}"
                    ))));
                }
            }
        }

        run.task_runs[index].confirmations_satisfied = true;
        Ok(None)
    }

    async fn required_incoming(&self, run: &JobRun, index: usize) -> Result<u64> {
        let task = &run.task_runs[index].task;
        let mut required = task.confirmations.unwrap_or(0);
        if let TaskKind::Bridge { name, .. } = &task.kind {
            if let Some(bridge) = self.store().bridge(name).await? {
                required = required.max(bridge.confirmations);
            }
        }
        if run.request.log.is_some() {
            required = required.max(self.inner.settings.min_incoming_confirmations);
        }
        Ok(required)
    }

    async fn perform(&self, run: &mut JobRun, index: usize, kind: &TaskKind) -> Result<Step> {
        let Some(adapter) = self.inner.services.adapters.get(kind.tag()) else {
            return Ok(Step::Fail(format!("no executor for {:?} tasks", kind.tag())));
        };
        let bridge = match kind {
            TaskKind::Bridge { name, .. } => match self.store().bridge(name).await? {
                Some(bridge) => Some(bridge),
                None => return Ok(Step::Fail(format!("bridge {name} is not registered"))),
            },
            _ => None,
        };

        let task_run_id = run.task_runs[index].id;
        let result = run.prior_result(index);
        let outcome = adapter
            .perform(TaskInput {
                run_id: run.id,
                task_run_id,
                kind,
                result: &result,
                data: &run.data,
                bridge: bridge.as_ref(),
            })
            .await;

        Ok(match outcome {
            TaskOutcome::Completed { result, data } => {
                merge_data(&mut run.data, data);
                run.complete_task(index, result);
                Step::Continue
            }
            TaskOutcome::Pending => Step::Suspend(Suspension::Bridge {
                task_index: index,
                task_run_id,
            }),
            TaskOutcome::Errored(reason) => Step::Fail(reason),
        })
    }

    async fn eth_tx(&self, run: &mut JobRun, index: usize, payload: EthTxPayload) -> Result<Step> {
        let txm = &self.inner.services.txm;
        let tx_id = match run.task_runs[index].tx_id {
            Some(tx_id) => tx_id,
            None => {
                let request = match payload.resolve(run, index, &self.inner.settings) {
                    Ok(request) => request,
                    Err(err) => return Ok(Step::Fail(format!("{err:#}"))),
                };
                match txm.submit(request).await {
                    Ok(tx) => {
                        run.task_runs[index].tx_id = Some(tx.id);
                        tx.id
                    }
                    Err(err) if is_transient(&err) => {
                        tracing::warn!(run_id = %run.id, task_index = index, error = %err, "chain unreachable; ethtx waits for connection");
                        return Ok(Step::Suspend(Suspension::Connection { task_index: index }));
                    }
                    Err(err) => return Ok(Step::Fail(format!("{err:#}"))),
                }
            }
        };

        let required = self.inner.settings.min_outgoing_confirmations;
        Ok(match txm.tx_progress(tx_id, required).await? {
            TxProgress::Safe { hash } => {
                run.task_runs[index].observed_confirmations = required;
                run.complete_task(index, Value::String(hash.to_string()));
                Step::Continue
            }
            TxProgress::Confirmed { confirmations } => {
                run.task_runs[index].observed_confirmations = confirmations;
                Step::Suspend(Suspension::OutgoingConfirmations {
                    task_index: index,
                    tx_id,
                })
            }
            TxProgress::Pending => Step::Suspend(Suspension::OutgoingConfirmations {
                task_index: index,
                tx_id,
            }),
            TxProgress::Errored { reason } => Step::Fail(reason),
        })
    }

    async fn process_head(&self, number: u64) -> Result<()> {
        let runs = self
            .store()
            .runs_with_status(&RunStatus::HEAD_DRIVEN)
            .await?;
        let event = ResumeEvent::Head { number };
        let results = join_all(runs.iter().map(|run| self.resume(run.id, event))).await;
        for (run, result) in runs.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(run_id = %run.id, head = number, error = %err, "failed to resume run on head");
            }
        }
        Ok(())
    }
}

impl HeadSubscriber for RunManager {
    fn name(&self) -> &str {
        "run_manager"
    }

    fn on_new_head<'a>(&'a self, event: &'a HeadEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.process_head(event.head.number))
    }
}

/// Transaction fields configured on the task; unset ones come from run data
/// (`address`, `functionSelector`, `dataPrefix`).
struct EthTxPayload {
    address: Option<Address>,
    function_selector: Option<Bytes>,
    data_prefix: Option<Bytes>,
    gas_limit: Option<u64>,
}

impl EthTxPayload {
    fn resolve(self, run: &JobRun, index: usize, settings: &RunSettings) -> Result<NewTx> {
        let to = match self.address {
            Some(address) => address,
            None => from_data::<Address>(&run.data, "address")?
                .ok_or_else(|| anyhow!("no address configured for ethtx task"))?,
        };
        let selector = match self.function_selector {
            Some(selector) => selector,
            None => from_data::<Bytes>(&run.data, "functionSelector")?.unwrap_or_default(),
        };
        let prefix = match self.data_prefix {
            Some(prefix) => prefix,
            None => from_data::<Bytes>(&run.data, "dataPrefix")?.unwrap_or_default(),
        };
        let argument = result_bytes(&run.prior_result(index)).context("ethtx input")?;

        let mut data = Vec::with_capacity(selector.len() + prefix.len() + argument.len());
        data.extend_from_slice(&selector);
        data.extend_from_slice(&prefix);
        data.extend_from_slice(&argument);

        Ok(NewTx {
            from: settings.from_address,
            to,
            value: U256::ZERO,
            data: Bytes::from(data),
            gas_limit: self.gas_limit.unwrap_or(settings.default_gas_limit),
            owner: TxOwner {
                run_id: run.id,
                task_index: index,
            },
        })
    }
}

fn from_data<T: DeserializeOwned>(data: &Map<String, Value>, key: &str) -> Result<Option<T>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .with_context(|| format!("invalid {key} in run data")),
    }
}

fn merge_data(target: &mut Map<String, Value>, data: Option<Map<String, Value>>) {
    if let Some(data) = data {
        target.extend(data);
    }
}
