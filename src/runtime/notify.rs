//! Upward reporting of finished runs.

use crate::jobs::run::{JobRun, RunStatus};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[async_trait]
pub trait RunNotifier: Send + Sync {
    /// Called once per run when it reaches a terminal status.
    async fn run_finished(&self, run: &JobRun);
}

/// Logs each finished run at a level matching its outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl RunNotifier for TracingNotifier {
    async fn run_finished(&self, run: &JobRun) {
        match run.status {
            RunStatus::Completed => tracing::info!(
                run_id = %run.id,
                job_id = %run.job_id,
                result = ?run.result,
                "run completed"
            ),
            RunStatus::Cancelled => {
                tracing::info!(run_id = %run.id, job_id = %run.job_id, "run cancelled")
            }
            _ => tracing::warn!(
                run_id = %run.id,
                job_id = %run.job_id,
                status = ?run.status,
                error = run.error.as_deref().unwrap_or("unknown"),
                "run errored"
            ),
        }
    }
}

/// POSTs the finished run as JSON. Delivery failures are logged and never
/// affect the run.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: Url, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl RunNotifier for WebhookNotifier {
    async fn run_finished(&self, run: &JobRun) {
        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(run)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(run_id = %run.id, url = %self.url, "run webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(run_id = %run.id, url = %self.url, status = %response.status(), "run webhook rejected");
            }
            Err(err) => {
                tracing::warn!(run_id = %run.id, url = %self.url, error = %err, "run webhook failed");
            }
        }
    }
}

/// Forwards to every notifier in order.
#[derive(Default, Clone)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn RunNotifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn RunNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl RunNotifier for NotifierSet {
    async fn run_finished(&self, run: &JobRun) {
        for notifier in &self.notifiers {
            notifier.run_finished(run).await;
        }
    }
}
