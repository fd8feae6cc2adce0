//! Jobs and their runs: typed specifications, the task executors, and the
//! state machine that drives runs through suspension and resumption.

pub mod adapters;
pub mod bridge;
pub mod decimal;
pub mod run;
pub mod runner;
pub mod spec;
pub mod timers;

pub use adapters::{AdapterTable, TaskOutcome};
pub use bridge::{BridgeResponse, BridgeType};
pub use run::{JobRun, ResumeEvent, RunRequest, RunStatus, Suspension, TaskRun};
pub use runner::{CallbackError, RunManager, RunServices, RunSettings};
pub use spec::{Initiator, JobSpec, JobSpecError, JobSpecRequest, TaskKind, TaskSpec};
