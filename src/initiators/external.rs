//! External initiators: out-of-process services that watch some source of
//! events and ask the node to run jobs. The node tells an initiator about
//! each job that names it, and accepts run requests authenticated with the
//! initiator's access key and secret.

use crate::jobs::run::{JobRun, RunRequest};
use crate::jobs::runner::RunManager;
use crate::jobs::spec::JobSpec;
use crate::store::Store;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const ACCESS_KEY_HEADER: &str = "X-Chainlink-EA-AccessKey";
pub const SECRET_HEADER: &str = "X-Chainlink-EA-Secret";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalInitiator {
    /// Lowercase name jobs refer to.
    pub name: String,
    /// Where job notices are sent; initiators without one are never called.
    pub url: Option<Url>,
    /// Presented by the initiator when it triggers runs.
    pub access_key: String,
    pub secret: String,
    /// Presented by the node when it calls the initiator.
    pub outgoing_token: String,
    pub outgoing_secret: String,
}

impl ExternalInitiator {
    pub fn new(name: &str, url: Option<Url>) -> Self {
        let token = || Uuid::new_v4().simple().to_string();
        Self {
            name: name.trim().to_ascii_lowercase(),
            url,
            access_key: token(),
            secret: token(),
            outgoing_token: token(),
            outgoing_secret: token(),
        }
    }
}

/// Body posted to an external initiator when a job naming it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpecNotice {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Value,
}

pub struct ExternalInitiatorManager {
    store: Arc<dyn Store>,
    runs: RunManager,
    http: reqwest::Client,
    timeout: Duration,
}

impl ExternalInitiatorManager {
    pub fn new(
        store: Arc<dyn Store>,
        runs: RunManager,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            runs,
            http,
            timeout,
        }
    }

    /// Registers an initiator and returns it with freshly generated
    /// credentials.
    pub async fn register(&self, name: &str, url: Option<Url>) -> Result<ExternalInitiator> {
        let initiator = ExternalInitiator::new(name, url);
        if initiator.name.is_empty() {
            bail!("external initiator name cannot be empty");
        }
        if self.store.external_initiator(&initiator.name).await?.is_some() {
            bail!("external initiator {} already exists", initiator.name);
        }
        self.store
            .save_external_initiator(&initiator)
            .await
            .context("failed to persist external initiator")?;
        tracing::info!(name = %initiator.name, url = ?initiator.url, "external initiator registered");
        Ok(initiator)
    }

    /// Sends a [`JobSpecNotice`] to every initiator `job` names that has a URL.
    pub async fn notify_job(&self, job: &JobSpec) -> Result<()> {
        for (name, params) in job.external_initiators() {
            let initiator = self
                .store
                .external_initiator(name)
                .await?
                .ok_or_else(|| anyhow!("external initiator {name} is not registered"))?;
            let Some(url) = initiator.url.as_ref() else {
                continue;
            };

            let notice = JobSpecNotice {
                job_id: job.id,
                kind: "external".to_owned(),
                params: params.clone(),
            };
            let response = self
                .http
                .post(url.clone())
                .timeout(self.timeout)
                .header(ACCESS_KEY_HEADER, initiator.outgoing_token.as_str())
                .header(SECRET_HEADER, initiator.outgoing_secret.as_str())
                .json(&notice)
                .send()
                .await
                .with_context(|| format!("external initiator {name} unreachable"))?;
            let status = response.status();
            if !status.is_success() {
                bail!("external initiator {name} rejected job notice with {status}");
            }
            tracing::info!(job_id = %job.id, initiator = name, "external initiator notified");
        }
        Ok(())
    }

    pub async fn authenticate(&self, access_key: &str, secret: &str) -> Result<ExternalInitiator> {
        let initiator = self
            .store
            .external_initiator_by_access_key(access_key)
            .await?
            .ok_or_else(|| anyhow!("unknown external initiator access key"))?;
        if initiator.secret != secret {
            bail!("invalid secret for external initiator {}", initiator.name);
        }
        Ok(initiator)
    }

    /// Creates a run for `job_id` on behalf of the initiator owning
    /// `access_key`. The job must name that initiator.
    pub async fn trigger(
        &self,
        access_key: &str,
        secret: &str,
        job_id: Uuid,
        params: Value,
    ) -> Result<JobRun> {
        let initiator = self.authenticate(access_key, secret).await?;
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} does not exist"))?;
        if !job
            .external_initiators()
            .any(|(name, _)| name.eq_ignore_ascii_case(&initiator.name))
        {
            bail!(
                "job {job_id} does not accept runs from external initiator {}",
                initiator.name
            );
        }
        self.runs
            .spawn_run(job_id, RunRequest::new("external", params))
            .await
    }
}
