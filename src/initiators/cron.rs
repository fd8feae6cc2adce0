use crate::jobs::run::RunRequest;
use crate::jobs::runner::RunManager;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use std::str::FromStr;
use tokio::select;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Parses a job schedule. Accepts six-field (seconds first) and five-field
/// expressions, optionally prefixed with `CRON_TZ=UTC`; schedules always
/// run in UTC.
pub fn parse_schedule(raw: &str) -> Result<Schedule> {
    let mut expression = raw.trim();
    if let Some(rest) = expression.strip_prefix("CRON_TZ=") {
        let (zone, rest) = rest
            .split_once(char::is_whitespace)
            .context("CRON_TZ must be followed by a schedule")?;
        if !zone.eq_ignore_ascii_case("UTC") {
            bail!("unsupported schedule time zone {zone:?}; only UTC is supported");
        }
        expression = rest.trim();
    }

    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_owned(),
        _ => bail!("schedule {raw:?} must have 5 or 6 fields, found {fields}"),
    };
    Schedule::from_str(&normalized).with_context(|| format!("invalid schedule {raw:?}"))
}

/// Creates one run per schedule tick until cancelled.
pub(crate) async fn run_schedule(
    runs: RunManager,
    job_id: Uuid,
    schedule: Schedule,
    shutdown: CancellationToken,
) {
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let after = match last_fired {
            Some(fired) => fired.max(Utc::now()),
            None => Utc::now(),
        };
        let Some(next) = schedule.after(&after).next() else {
            tracing::info!(%job_id, "cron schedule exhausted");
            break;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or_default();

        select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {
                last_fired = Some(next);
                match runs.spawn_run(job_id, RunRequest::new("cron", Value::Null)).await {
                    Ok(run) => tracing::debug!(%job_id, run_id = %run.id, tick = %next, "cron run created"),
                    Err(err) => tracing::warn!(%job_id, tick = %next, error = %err, "cron tick skipped"),
                }
            }
        }
    }
}
