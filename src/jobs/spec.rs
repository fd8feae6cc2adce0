//! Job specifications: what triggers a job and the fixed task pipeline it
//! runs. Specs are parsed and validated once, when the job is created; runs
//! only ever see the typed form.

use crate::initiators::cron::parse_schedule;
use crate::jobs::decimal::Decimal;
use alloy_primitives::{Address, Bytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

const BUILTIN_TASKS: &[&str] = &[
    "httpget",
    "httppost",
    "jsonparse",
    "copy",
    "multiply",
    "ethuint256",
    "ethint256",
    "ethbytes32",
    "ethtx",
    "sleep",
    "noop",
];

const INITIATOR_TYPES: &[&str] = &[
    "web",
    "cron",
    "runat",
    "runlog",
    "ethlog",
    "external",
    "fluxmonitor",
];

const DEFAULT_FLUX_POLL_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq)]
pub enum JobSpecError {
    #[error("job must declare at least one initiator")]
    NoInitiators,
    #[error("job must declare at least one task")]
    NoTasks,
    #[error("unknown initiator type {0:?}")]
    UnknownInitiator(String),
    #[error("unknown task type {0:?}")]
    UnknownTaskType(String),
    #[error("invalid params for {kind}: {reason}")]
    InvalidParams { kind: String, reason: String },
    #[error("startAt must be earlier than endAt")]
    InvalidWindow,
    #[error("external initiator {0:?} is not registered")]
    UnknownExternalInitiator(String),
}

impl JobSpecError {
    fn params(kind: &str, reason: impl ToString) -> Self {
        JobSpecError::InvalidParams {
            kind: kind.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Job creation payload as submitted by an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpecRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub initiators: Vec<InitiatorRequest>,
    #[serde(default)]
    pub tasks: Vec<TaskRequest>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatorRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub confirmations: Option<u64>,
    #[serde(default)]
    pub params: Value,
}

impl JobSpecRequest {
    /// Task type names that are not built in and must resolve to a bridge.
    pub fn bridge_candidates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .iter()
            .map(|task| task.kind.trim().to_ascii_lowercase())
            .filter(|kind| !BUILTIN_TASKS.contains(&kind.as_str()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Initiator {
    Web,
    Cron {
        schedule: String,
    },
    RunAt {
        time: DateTime<Utc>,
    },
    RunLog {
        #[serde(default)]
        address: Option<Address>,
    },
    EthLog {
        address: Address,
    },
    External {
        name: String,
        #[serde(default)]
        params: Value,
    },
    FluxMonitor(FluxMonitorParams),
}

impl Initiator {
    pub fn label(&self) -> &'static str {
        match self {
            Initiator::Web => "web",
            Initiator::Cron { .. } => "cron",
            Initiator::RunAt { .. } => "runat",
            Initiator::RunLog { .. } => "runlog",
            Initiator::EthLog { .. } => "ethlog",
            Initiator::External { .. } => "external",
            Initiator::FluxMonitor(_) => "fluxmonitor",
        }
    }

    fn parse(request: &InitiatorRequest) -> Result<Self, JobSpecError> {
        let kind = request.kind.trim().to_ascii_lowercase();
        if !INITIATOR_TYPES.contains(&kind.as_str()) {
            return Err(JobSpecError::UnknownInitiator(request.kind.clone()));
        }

        let initiator: Initiator = serde_json::from_value(tagged(&kind, &request.params))
            .map_err(|err| JobSpecError::params(&kind, err))?;

        match &initiator {
            Initiator::Cron { schedule } => {
                parse_schedule(schedule).map_err(|err| JobSpecError::params(&kind, err))?;
            }
            Initiator::External { name, .. } if name.trim().is_empty() => {
                return Err(JobSpecError::params(&kind, "name cannot be empty"));
            }
            Initiator::FluxMonitor(params) => params.validate()?,
            _ => {}
        }

        Ok(initiator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxMonitorParams {
    pub feeds: Vec<Url>,
    /// Minimum relative deviation, in percent, that triggers a new round.
    pub threshold: f64,
    #[serde(with = "humantime_serde", default = "default_flux_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default)]
    pub idle_timer: Option<Duration>,
    pub address: Address,
    #[serde(default = "default_flux_selector")]
    pub function_selector: Bytes,
}

impl FluxMonitorParams {
    fn validate(&self) -> Result<(), JobSpecError> {
        if self.feeds.is_empty() {
            return Err(JobSpecError::params("fluxmonitor", "feeds cannot be empty"));
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(JobSpecError::params(
                "fluxmonitor",
                "threshold must be a positive percentage",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(JobSpecError::params(
                "fluxmonitor",
                "pollInterval must be greater than 0",
            ));
        }
        if self.function_selector.len() != 4 {
            return Err(JobSpecError::params(
                "fluxmonitor",
                "functionSelector must be 4 bytes",
            ));
        }
        Ok(())
    }
}

fn default_flux_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_FLUX_POLL_SECS)
}

fn default_flux_selector() -> Bytes {
    // submit(uint256,int256)
    Bytes::from_static(&[0x20, 0x2e, 0xe0, 0xed])
}

/// Typed task configuration. Fields left unset here fall back to the run's
/// request data at execution time (run-log requests carry `get`, `path`,
/// `times` and similar keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TaskKind {
    HttpGet {
        #[serde(default, alias = "get")]
        url: Option<Url>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    HttpPost {
        #[serde(default, alias = "post")]
        url: Option<Url>,
        #[serde(default)]
        body: Option<Value>,
    },
    JsonParse {
        #[serde(default)]
        path: Option<Vec<String>>,
    },
    Copy {
        #[serde(default)]
        copy_path: Option<Vec<String>>,
    },
    Multiply {
        #[serde(default)]
        times: Option<Decimal>,
    },
    EthUint256,
    EthInt256,
    EthBytes32,
    EthTx {
        #[serde(default)]
        address: Option<Address>,
        #[serde(default)]
        function_selector: Option<Bytes>,
        #[serde(default)]
        data_prefix: Option<Bytes>,
        #[serde(default)]
        gas_limit: Option<u64>,
    },
    Sleep {
        until: DateTime<Utc>,
    },
    NoOp,
    #[serde(skip_deserializing)]
    Bridge {
        name: String,
        params: Value,
    },
}

/// Discriminant of [`TaskKind`], used as the adapter table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskTag {
    HttpGet,
    HttpPost,
    JsonParse,
    Copy,
    Multiply,
    EthUint256,
    EthInt256,
    EthBytes32,
    EthTx,
    Sleep,
    NoOp,
    Bridge,
}

impl TaskKind {
    pub fn tag(&self) -> TaskTag {
        match self {
            TaskKind::HttpGet { .. } => TaskTag::HttpGet,
            TaskKind::HttpPost { .. } => TaskTag::HttpPost,
            TaskKind::JsonParse { .. } => TaskTag::JsonParse,
            TaskKind::Copy { .. } => TaskTag::Copy,
            TaskKind::Multiply { .. } => TaskTag::Multiply,
            TaskKind::EthUint256 => TaskTag::EthUint256,
            TaskKind::EthInt256 => TaskTag::EthInt256,
            TaskKind::EthBytes32 => TaskTag::EthBytes32,
            TaskKind::EthTx { .. } => TaskTag::EthTx,
            TaskKind::Sleep { .. } => TaskTag::Sleep,
            TaskKind::NoOp => TaskTag::NoOp,
            TaskKind::Bridge { .. } => TaskTag::Bridge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Incoming confirmations required before this task may execute.
    pub confirmations: Option<u64>,
}

impl TaskSpec {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            confirmations: None,
        }
    }

    fn parse(request: &TaskRequest, bridges: &HashSet<String>) -> Result<Self, JobSpecError> {
        let kind = request.kind.trim().to_ascii_lowercase();

        let task_kind = if BUILTIN_TASKS.contains(&kind.as_str()) {
            serde_json::from_value::<TaskKind>(tagged(&kind, &request.params))
                .map_err(|err| JobSpecError::params(&kind, err))?
        } else if bridges.contains(&kind) {
            TaskKind::Bridge {
                name: kind.clone(),
                params: request.params.clone(),
            }
        } else {
            return Err(JobSpecError::UnknownTaskType(request.kind.clone()));
        };

        match &task_kind {
            TaskKind::EthTx {
                function_selector: Some(selector),
                ..
            } if selector.len() != 4 => {
                return Err(JobSpecError::params(&kind, "functionSelector must be 4 bytes"));
            }
            TaskKind::JsonParse { path: Some(path) }
            | TaskKind::Copy {
                copy_path: Some(path),
            } if path.is_empty() => {
                return Err(JobSpecError::params(&kind, "path cannot be empty"));
            }
            _ => {}
        }

        Ok(Self {
            kind: task_kind,
            confirmations: request.confirmations,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub id: Uuid,
    pub name: Option<String>,
    pub initiators: Vec<Initiator>,
    pub tasks: Vec<TaskSpec>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub paused: bool,
}

impl JobSpec {
    /// Validates `request` and produces a job. `bridges` holds the lowercase
    /// names of registered bridge types.
    pub fn parse(request: &JobSpecRequest, bridges: &HashSet<String>) -> Result<Self, JobSpecError> {
        if request.initiators.is_empty() {
            return Err(JobSpecError::NoInitiators);
        }
        if request.tasks.is_empty() {
            return Err(JobSpecError::NoTasks);
        }
        if let (Some(start), Some(end)) = (request.start_at, request.end_at) {
            if start >= end {
                return Err(JobSpecError::InvalidWindow);
            }
        }

        let initiators = request
            .initiators
            .iter()
            .map(Initiator::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let tasks = request
            .tasks
            .iter()
            .map(|task| TaskSpec::parse(task, bridges))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            initiators,
            tasks,
            start_at: request.start_at,
            end_at: request.end_at,
            created_at: Utc::now(),
            paused: false,
        })
    }

    pub fn has_initiator(&self, label: &str) -> bool {
        self.initiators
            .iter()
            .any(|initiator| initiator.label() == label)
    }

    /// Names of external initiators this job expects pushes from.
    pub fn external_initiators(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.initiators.iter().filter_map(|initiator| match initiator {
            Initiator::External { name, params } => Some((name.as_str(), params)),
            _ => None,
        })
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.paused
            && self.start_at.map(|start| now >= start).unwrap_or(true)
            && self.end_at.map(|end| now < end).unwrap_or(true)
    }
}

/// Builds `{"type": kind, ...params}` so serde can select the variant.
fn tagged(kind: &str, params: &Value) -> Value {
    let mut object = match params {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    object.insert("type".to_owned(), Value::String(kind.to_owned()));
    Value::Object(object)
}
