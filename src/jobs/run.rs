//! Job runs and their task runs. A run owns its accumulated data and records
//! exactly which external event it is parked on, so resuming it is a pure
//! check of that record against the incoming event.

use crate::chain::Log;
use crate::jobs::spec::{JobSpec, TaskSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Unstarted,
    InProgress,
    PendingIncomingConfirmations,
    PendingOutgoingConfirmations,
    PendingBridge,
    PendingConnection,
    PendingSleep,
    Completed,
    Errored,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Errored | RunStatus::Cancelled
        )
    }

    /// Statuses a run can be parked in while waiting for a new head.
    pub const HEAD_DRIVEN: [RunStatus; 3] = [
        RunStatus::PendingIncomingConfirmations,
        RunStatus::PendingOutgoingConfirmations,
        RunStatus::PendingConnection,
    ];
}

/// What created a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub initiator: String,
    #[serde(default)]
    pub log: Option<Log>,
    #[serde(default)]
    pub params: Value,
}

impl RunRequest {
    pub fn new(initiator: impl Into<String>, params: Value) -> Self {
        Self {
            initiator: initiator.into(),
            log: None,
            params,
        }
    }

    pub fn web(params: Value) -> Self {
        Self::new("web", params)
    }

    pub fn with_log(mut self, log: Log) -> Self {
        self.log = Some(log);
        self
    }
}

/// The external event a parked run waits for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suspension {
    IncomingConfirmations { task_index: usize, required: u64 },
    OutgoingConfirmations { task_index: usize, tx_id: Uuid },
    Bridge { task_index: usize, task_run_id: Uuid },
    Sleep { task_index: usize, until: DateTime<Utc> },
    Connection { task_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeEvent {
    Head { number: u64 },
    BridgeCallback { task_run_id: Uuid },
    Timer { now: DateTime<Utc> },
}

impl Suspension {
    pub fn task_index(&self) -> usize {
        match self {
            Suspension::IncomingConfirmations { task_index, .. }
            | Suspension::OutgoingConfirmations { task_index, .. }
            | Suspension::Bridge { task_index, .. }
            | Suspension::Sleep { task_index, .. }
            | Suspension::Connection { task_index } => *task_index,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Suspension::IncomingConfirmations { .. } => RunStatus::PendingIncomingConfirmations,
            Suspension::OutgoingConfirmations { .. } => RunStatus::PendingOutgoingConfirmations,
            Suspension::Bridge { .. } => RunStatus::PendingBridge,
            Suspension::Sleep { .. } => RunStatus::PendingSleep,
            Suspension::Connection { .. } => RunStatus::PendingConnection,
        }
    }

    /// Whether `event` is the one this suspension was parked on.
    pub fn awaits(&self, event: &ResumeEvent) -> bool {
        match (self, event) {
            (
                Suspension::IncomingConfirmations { .. }
                | Suspension::OutgoingConfirmations { .. }
                | Suspension::Connection { .. },
                ResumeEvent::Head { .. },
            ) => true,
            (
                Suspension::Bridge { task_run_id, .. },
                ResumeEvent::BridgeCallback {
                    task_run_id: incoming,
                },
            ) => task_run_id == incoming,
            (Suspension::Sleep { until, .. }, ResumeEvent::Timer { now }) => now >= until,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: Uuid,
    pub index: usize,
    pub task: TaskSpec,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub observed_confirmations: u64,
    pub confirmations_satisfied: bool,
    pub tx_id: Option<Uuid>,
}

impl TaskRun {
    fn new(index: usize, task: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            task,
            status: RunStatus::Unstarted,
            result: None,
            error: None,
            observed_confirmations: 0,
            confirmations_satisfied: false,
            tx_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub task_runs: Vec<TaskRun>,
    pub request: RunRequest,
    pub data: Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Canonical tip when the run was created; confirmation base for runs
    /// without a triggering log.
    pub creation_height: Option<u64>,
    pub suspension: Option<Suspension>,
    /// Set once the triggering log's receipt has been checked against the
    /// canonical chain.
    pub log_validated: bool,
}

impl JobRun {
    pub fn new(job: &JobSpec, request: RunRequest, creation_height: Option<u64>) -> Self {
        let now = Utc::now();
        let data = match &request.params {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let task_runs = job
            .tasks
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, task)| TaskRun::new(index, task))
            .collect();

        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            status: RunStatus::Unstarted,
            created_at: now,
            updated_at: now,
            finished_at: None,
            task_runs,
            request,
            data,
            result: None,
            error: None,
            creation_height,
            suspension: None,
            log_validated: false,
        }
    }

    /// Index of the first task that has not completed.
    pub fn next_task_index(&self) -> Option<usize> {
        self.task_runs
            .iter()
            .position(|task_run| task_run.status != RunStatus::Completed)
    }

    /// Result of the last completed task, or the request's `result` key when
    /// no task has run yet.
    pub fn prior_result(&self, index: usize) -> Value {
        self.task_runs[..index]
            .iter()
            .rev()
            .find_map(|task_run| task_run.result.clone())
            .or_else(|| self.data.get("result").cloned())
            .unwrap_or(Value::Null)
    }

    pub fn suspend(&mut self, suspension: Suspension) {
        let status = suspension.status();
        let index = suspension.task_index();
        if let Some(task_run) = self.task_runs.get_mut(index) {
            task_run.status = status;
        }
        self.status = status;
        self.suspension = Some(suspension);
        self.touch();
    }

    pub fn complete_task(&mut self, index: usize, result: Value) {
        if let Some(task_run) = self.task_runs.get_mut(index) {
            task_run.status = RunStatus::Completed;
            task_run.result = Some(result.clone());
            task_run.error = None;
        }
        self.data.insert("result".to_owned(), result);
        self.suspension = None;
        self.status = RunStatus::InProgress;
        self.touch();
    }

    pub fn fail(&mut self, index: Option<usize>, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(task_run) = index.and_then(|index| self.task_runs.get_mut(index)) {
            task_run.status = RunStatus::Errored;
            task_run.error = Some(reason.clone());
        }
        self.finish(RunStatus::Errored);
        self.error = Some(reason);
    }

    pub fn cancel(&mut self) {
        for task_run in self
            .task_runs
            .iter_mut()
            .filter(|task_run| !task_run.status.is_terminal())
        {
            task_run.status = RunStatus::Cancelled;
        }
        self.finish(RunStatus::Cancelled);
    }

    pub fn complete(&mut self) {
        self.result = self
            .task_runs
            .last()
            .and_then(|task_run| task_run.result.clone());
        self.finish(RunStatus::Completed);
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.suspension = None;
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
