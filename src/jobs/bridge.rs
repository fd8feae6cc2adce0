//! Bridges: named external adapters reached over HTTP. A bridge may answer
//! synchronously or park the task until it calls back.

use crate::jobs::adapters::{Adapter, TaskInput, TaskOutcome};
use crate::jobs::spec::TaskKind;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeType {
    /// Lowercase task type name.
    pub name: String,
    pub url: Url,
    /// Minimum incoming confirmations for tasks using this bridge.
    #[serde(default)]
    pub confirmations: u64,
    /// Sent to the bridge; bridges present it back on callbacks.
    pub outgoing_token: String,
    /// Expected from the bridge on inbound requests.
    pub incoming_token: String,
}

impl BridgeType {
    pub fn new(name: &str, url: Url) -> Self {
        Self {
            name: name.trim().to_ascii_lowercase(),
            url,
            confirmations: 0,
            outgoing_token: Uuid::new_v4().simple().to_string(),
            incoming_token: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("bridge name cannot be empty");
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!("bridge name {:?} must be alphanumeric", self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BridgeRequest {
    id: Uuid,
    task_run_id: Uuid,
    data: Value,
    #[serde(rename = "responseURL", skip_serializing_if = "Option::is_none")]
    response_url: Option<String>,
}

/// Body of a bridge response, or of its asynchronous callback. The result
/// is read from `data.result`, or from a top-level `result` when the bridge
/// sends no envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    /// Echo of the request's `taskRunId`. Bridges that echo it get repeated
    /// callbacks for an already finished task rejected.
    #[serde(default)]
    pub task_run_id: Option<Uuid>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl BridgeResponse {
    pub fn into_outcome(self) -> TaskOutcome {
        if let Some(error) = self.error.filter(|error| !error.is_null()) {
            let reason = match error {
                Value::String(text) => text,
                other => other.to_string(),
            };
            return TaskOutcome::Errored(reason);
        }
        if self.pending {
            return TaskOutcome::Pending;
        }
        let mut data = self.data.unwrap_or_default();
        let result = match data.get("result") {
            Some(result) => result.clone(),
            None => {
                let result = self.result.unwrap_or(Value::Null);
                if !result.is_null() {
                    data.insert("result".to_owned(), result.clone());
                }
                result
            }
        };
        TaskOutcome::Completed {
            result,
            data: Some(data),
        }
    }
}

pub struct BridgeAdapter {
    client: reqwest::Client,
    response_url: Option<Url>,
}

impl BridgeAdapter {
    pub fn new(client: reqwest::Client, response_url: Option<Url>) -> Self {
        Self {
            client,
            response_url,
        }
    }

    /// Callback URL for `run_id`: `<base>/v2/runs/<run_id>`.
    fn callback_url(&self, run_id: Uuid) -> Option<String> {
        self.response_url.as_ref().map(|base| {
            format!("{}/v2/runs/{run_id}", base.as_str().trim_end_matches('/'))
        })
    }

    async fn call(&self, bridge: &BridgeType, input: &TaskInput<'_>) -> Result<BridgeResponse> {
        let params = match input.kind {
            TaskKind::Bridge { params, .. } => params,
            _ => &Value::Null,
        };
        let mut data = input.document();
        if let (Value::Object(document), Value::Object(extra)) = (&mut data, params) {
            for (key, value) in extra {
                document.insert(key.clone(), value.clone());
            }
        }

        let request = BridgeRequest {
            id: input.run_id,
            task_run_id: input.task_run_id,
            data,
            response_url: self.callback_url(input.run_id),
        };

        let response = self
            .client
            .post(bridge.url.clone())
            .bearer_auth(&bridge.outgoing_token)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("bridge {} unreachable", bridge.name))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read response from bridge {}", bridge.name))?;
        if !status.is_success() {
            bail!("bridge {} returned {status}: {body}", bridge.name);
        }
        serde_json::from_str(&body)
            .with_context(|| format!("bridge {} returned malformed JSON", bridge.name))
    }
}

#[async_trait]
impl Adapter for BridgeAdapter {
    async fn perform(&self, input: TaskInput<'_>) -> TaskOutcome {
        let Some(bridge) = input.bridge else {
            return TaskOutcome::Errored("bridge task without a registered bridge".to_owned());
        };

        match self.call(bridge, &input).await {
            Ok(response) => {
                let outcome = response.into_outcome();
                tracing::debug!(
                    bridge = %bridge.name,
                    run_id = %input.run_id,
                    pending = matches!(outcome, TaskOutcome::Pending),
                    "bridge responded"
                );
                outcome
            }
            Err(err) => {
                tracing::warn!(bridge = %bridge.name, run_id = %input.run_id, error = %err, "bridge call failed");
                TaskOutcome::Errored(format!("{err:#}"))
            }
        }
    }
}
