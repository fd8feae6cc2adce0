use crate::jobs::run::RunRequest;
use crate::jobs::runner::RunManager;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) const RUN_AT_INITIATOR: &str = "runat";

/// Creates a single run once the wall clock reaches `at`. A job that already
/// has a run-at run (for example before a restart) is not fired again.
pub(crate) async fn run_at(
    runs: RunManager,
    store: Arc<dyn Store>,
    job_id: Uuid,
    at: DateTime<Utc>,
    shutdown: CancellationToken,
) {
    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    match fire(&runs, store.as_ref(), job_id).await {
        Ok(true) => tracing::info!(%job_id, %at, "run-at fired"),
        Ok(false) => tracing::debug!(%job_id, %at, "run-at already fired"),
        Err(err) => tracing::warn!(%job_id, %at, error = %err, "run-at failed"),
    }
}

async fn fire(runs: &RunManager, store: &dyn Store, job_id: Uuid) -> Result<bool> {
    let fired = store
        .runs_for_job(job_id)
        .await?
        .iter()
        .any(|run| run.request.initiator == RUN_AT_INITIATOR);
    if fired {
        return Ok(false);
    }
    runs.spawn_run(job_id, RunRequest::new(RUN_AT_INITIATOR, Value::Null))
        .await?;
    Ok(true)
}
