//! Everything that creates runs on its own: schedules, one-shot timers, log
//! listeners, flux monitors, and external initiators. [`Initiators`] starts
//! and stops the per-job pieces as jobs are activated and deactivated.

pub mod cron;
pub mod external;
pub mod flux;
pub mod run_at;
pub mod run_log;

use crate::jobs::runner::RunManager;
use crate::jobs::spec::{Initiator, JobSpec};
use crate::logs::{LogBroadcaster, LogListener};
use crate::store::Store;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use self::flux::{FluxMonitor, NewRoundListener};
use self::run_log::{listener_id, LogInitiator, LogInitiatorListener};

struct ActiveJob {
    token: CancellationToken,
    listeners: Vec<String>,
}

pub struct Initiators {
    runs: RunManager,
    store: Arc<dyn Store>,
    broadcaster: Arc<LogBroadcaster>,
    http: reqwest::Client,
    http_timeout: Duration,
    root: CancellationToken,
    tracker: TaskTracker,
    active: Mutex<HashMap<Uuid, ActiveJob>>,
}

impl Initiators {
    pub fn new(
        runs: RunManager,
        store: Arc<dyn Store>,
        broadcaster: Arc<LogBroadcaster>,
        http: reqwest::Client,
        http_timeout: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            runs,
            store,
            broadcaster,
            http,
            http_timeout,
            root,
            tracker: TaskTracker::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Starts every initiator of `job`. Activating an active job is a no-op.
    pub fn activate(&self, job: &JobSpec) {
        let mut active = self.active.lock().expect("active initiators poisoned");
        if active.contains_key(&job.id) {
            return;
        }

        let token = self.root.child_token();
        let mut listeners = Vec::new();
        for initiator in &job.initiators {
            match initiator {
                Initiator::Web | Initiator::External { .. } => {}
                Initiator::Cron { schedule } => match cron::parse_schedule(schedule) {
                    Ok(schedule) => {
                        self.tracker.spawn(cron::run_schedule(
                            self.runs.clone(),
                            job.id,
                            schedule,
                            token.clone(),
                        ));
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.id, error = %err, "stored cron schedule no longer parses");
                    }
                },
                Initiator::RunAt { time } => {
                    self.tracker.spawn(run_at::run_at(
                        self.runs.clone(),
                        self.store.clone(),
                        job.id,
                        *time,
                        token.clone(),
                    ));
                }
                Initiator::RunLog { address } => {
                    let listener = LogInitiatorListener::run_log(
                        job.id,
                        *address,
                        self.runs.clone(),
                        self.store.clone(),
                    );
                    listeners.push(listener_id(LogInitiator::RunLog, job.id));
                    self.broadcaster.register(Arc::new(listener));
                }
                Initiator::EthLog { address } => {
                    let listener = LogInitiatorListener::eth_log(
                        job.id,
                        *address,
                        self.runs.clone(),
                        self.store.clone(),
                    );
                    listeners.push(listener_id(LogInitiator::EthLog, job.id));
                    self.broadcaster.register(Arc::new(listener));
                }
                Initiator::FluxMonitor(params) => {
                    let (round_tx, rounds) = mpsc::unbounded_channel();
                    let listener = NewRoundListener::new(job.id, params.address, round_tx);
                    listeners.push(listener.id().to_owned());
                    self.broadcaster.register(Arc::new(listener));
                    let monitor = FluxMonitor::new(
                        job.id,
                        params.clone(),
                        self.runs.clone(),
                        self.http.clone(),
                        self.http_timeout,
                    );
                    self.tracker.spawn(monitor.run(rounds, token.clone()));
                }
            }
        }

        tracing::info!(job_id = %job.id, initiators = job.initiators.len(), "job activated");
        active.insert(job.id, ActiveJob { token, listeners });
    }

    /// Stops the job's initiators. Returns `false` when it was not active.
    pub fn deactivate(&self, job_id: Uuid) -> bool {
        let Some(job) = self
            .active
            .lock()
            .expect("active initiators poisoned")
            .remove(&job_id)
        else {
            return false;
        };
        job.token.cancel();
        for listener in &job.listeners {
            self.broadcaster.unregister(listener);
        }
        tracing::info!(%job_id, "job deactivated");
        true
    }

    pub fn is_active(&self, job_id: Uuid) -> bool {
        self.active
            .lock()
            .expect("active initiators poisoned")
            .contains_key(&job_id)
    }

    /// Activates every stored job that is not paused.
    pub async fn activate_all(&self) -> Result<usize> {
        let jobs = self.store.jobs().await?;
        let mut activated = 0;
        for job in jobs.iter().filter(|job| !job.paused) {
            self.activate(job);
            activated += 1;
        }
        Ok(activated)
    }

    /// Stops every initiator and waits for their tasks.
    pub async fn shutdown(&self) {
        let jobs: Vec<Uuid> = self
            .active
            .lock()
            .expect("active initiators poisoned")
            .keys()
            .copied()
            .collect();
        for job_id in jobs {
            self.deactivate(job_id);
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}
