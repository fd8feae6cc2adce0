//! Executors for the built-in task kinds. The table is assembled once at
//! startup and passed to the run manager; there is no global registry.
//! Transaction and sleep tasks suspend the run and are driven by the run
//! manager itself rather than through this table.

use crate::jobs::bridge::{BridgeAdapter, BridgeType};
use crate::jobs::decimal::Decimal;
use crate::jobs::spec::{TaskKind, TaskTag};
use alloy_primitives::{Bytes, U256};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

/// Everything a task sees when it executes.
pub struct TaskInput<'a> {
    pub run_id: Uuid,
    pub task_run_id: Uuid,
    pub kind: &'a TaskKind,
    /// Result of the previous task.
    pub result: &'a Value,
    /// Accumulated run data: request params plus merged bridge data.
    pub data: &'a Map<String, Value>,
    /// Bridge type for bridge tasks, resolved by the caller.
    pub bridge: Option<&'a BridgeType>,
}

impl TaskInput<'_> {
    /// `{result, ..data}`, the document posted to external services.
    pub fn document(&self) -> Value {
        let mut document = self.data.clone();
        document.insert("result".to_owned(), self.result.clone());
        Value::Object(document)
    }

    fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|value| !value.is_null())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        result: Value,
        data: Option<Map<String, Value>>,
    },
    Pending,
    Errored(String),
}

impl TaskOutcome {
    pub fn completed(result: Value) -> Self {
        TaskOutcome::Completed { result, data: None }
    }
}

impl From<Result<Value>> for TaskOutcome {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => TaskOutcome::completed(value),
            Err(err) => TaskOutcome::Errored(format!("{err:#}")),
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    async fn perform(&self, input: TaskInput<'_>) -> TaskOutcome;
}

#[derive(Clone, Default)]
pub struct AdapterTable {
    adapters: HashMap<TaskTag, Arc<dyn Adapter>>,
}

impl AdapterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every built-in executor. `http` is shared by the HTTP tasks
    /// and the bridge client; `response_url` is the base callback URL handed
    /// to bridges.
    pub fn standard(http: reqwest::Client, response_url: Option<Url>) -> Self {
        let http_adapter = Arc::new(HttpAdapter {
            client: http.clone(),
        });
        let numeric = Arc::new(NumericAdapter);

        Self::new()
            .with(TaskTag::HttpGet, http_adapter.clone())
            .with(TaskTag::HttpPost, http_adapter)
            .with(TaskTag::JsonParse, Arc::new(JsonParseAdapter))
            .with(TaskTag::Copy, Arc::new(CopyAdapter))
            .with(TaskTag::Multiply, numeric.clone())
            .with(TaskTag::EthUint256, numeric.clone())
            .with(TaskTag::EthInt256, numeric.clone())
            .with(TaskTag::EthBytes32, numeric)
            .with(TaskTag::NoOp, Arc::new(NoOpAdapter))
            .with(
                TaskTag::Bridge,
                Arc::new(BridgeAdapter::new(http, response_url)),
            )
    }

    pub fn with(mut self, tag: TaskTag, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(tag, adapter);
        self
    }

    pub fn get(&self, tag: TaskTag) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&tag).cloned()
    }
}

struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    async fn get(&self, input: &TaskInput<'_>) -> Result<Value> {
        let TaskKind::HttpGet { url, headers } = input.kind else {
            bail!("httpget adapter received {:?}", input.kind.tag());
        };
        let url = resolve_url(url.as_ref(), input, &["get", "url"])?;

        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        read_text(response).await
    }

    async fn post(&self, input: &TaskInput<'_>) -> Result<Value> {
        let TaskKind::HttpPost { url, body } = input.kind else {
            bail!("httppost adapter received {:?}", input.kind.tag());
        };
        let url = resolve_url(url.as_ref(), input, &["post", "url"])?;
        let body = body.clone().unwrap_or_else(|| input.document());

        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        read_text(response).await
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    async fn perform(&self, input: TaskInput<'_>) -> TaskOutcome {
        let result = match input.kind.tag() {
            TaskTag::HttpPost => self.post(&input).await,
            _ => self.get(&input).await,
        };
        result.into()
    }
}

fn resolve_url(configured: Option<&Url>, input: &TaskInput<'_>, keys: &[&str]) -> Result<Url> {
    if let Some(url) = configured {
        return Ok(url.clone());
    }
    let raw = keys
        .iter()
        .find_map(|key| input.data_field(key).and_then(Value::as_str))
        .ok_or_else(|| anyhow!("no url configured for http task"))?;
    Url::parse(raw).with_context(|| format!("invalid url {raw:?}"))
}

async fn read_text(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .context("failed to read http response body")?;
    if !status.is_success() {
        bail!("http request returned {status}: {body}");
    }
    Ok(Value::String(body))
}

struct JsonParseAdapter;

#[async_trait]
impl Adapter for JsonParseAdapter {
    async fn perform(&self, input: TaskInput<'_>) -> TaskOutcome {
        let TaskKind::JsonParse { path } = input.kind else {
            return TaskOutcome::Errored("jsonparse adapter misconfigured".to_owned());
        };
        let result = path_or_data(path.as_ref(), &input, "path").and_then(|path| {
            let document = match input.result {
                Value::String(text) => serde_json::from_str(text)
                    .with_context(|| "previous result is not a JSON document")?,
                other => other.clone(),
            };
            walk(&document, &path)
        });
        result.into()
    }
}

struct CopyAdapter;

#[async_trait]
impl Adapter for CopyAdapter {
    async fn perform(&self, input: TaskInput<'_>) -> TaskOutcome {
        let TaskKind::Copy { copy_path } = input.kind else {
            return TaskOutcome::Errored("copy adapter misconfigured".to_owned());
        };
        let result = path_or_data(copy_path.as_ref(), &input, "copyPath")
            .and_then(|path| walk(&Value::Object(input.data.clone()), &path));
        result.into()
    }
}

fn path_or_data(configured: Option<&Vec<String>>, input: &TaskInput<'_>, key: &str) -> Result<Vec<String>> {
    if let Some(path) = configured {
        return Ok(path.clone());
    }
    let value = input
        .data_field(key)
        .ok_or_else(|| anyhow!("no {key} configured"))?;
    match value {
        Value::String(single) => Ok(single.split('.').map(str::to_owned).collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(segment) => Ok(segment.clone()),
                other => Ok(other.to_string()),
            })
            .collect(),
        other => bail!("{key} must be a list of keys, got {other}"),
    }
}

/// Follows `path` through objects (by key) and arrays (by index).
fn walk(document: &Value, path: &[String]) -> Result<Value> {
    let mut current = document;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        }
        .ok_or_else(|| anyhow!("no value at path {}", path.join(".")))?;
    }
    Ok(current.clone())
}

struct NumericAdapter;

impl NumericAdapter {
    fn multiply(input: &TaskInput<'_>, times: Option<&Decimal>) -> Result<Value> {
        let value = Decimal::from_json(input.result).context("multiply input")?;
        let times = match times {
            Some(times) => *times,
            None => match input.data_field("times") {
                Some(raw) => Decimal::from_json(raw).context("times")?,
                None => return Ok(Value::String(value.to_string())),
            },
        };
        let product = value
            .checked_mul(&times)
            .ok_or_else(|| anyhow!("{value} * {times} overflows"))?;
        Ok(Value::String(product.to_string()))
    }
}

#[async_trait]
impl Adapter for NumericAdapter {
    async fn perform(&self, input: TaskInput<'_>) -> TaskOutcome {
        let result = match input.kind {
            TaskKind::Multiply { times } => Self::multiply(&input, times.as_ref()),
            TaskKind::EthUint256 => Decimal::from_json(input.result)
                .and_then(encode_uint256)
                .map(Value::String),
            TaskKind::EthInt256 => Decimal::from_json(input.result)
                .map(|value| encode_int256(value.trunc()))
                .map(Value::String),
            TaskKind::EthBytes32 => Ok(Value::String(encode_bytes32(input.result))),
            other => Err(anyhow!("numeric adapter received {:?}", other.tag())),
        };
        result.into()
    }
}

fn encode_word(word: U256) -> String {
    format!("0x{}", hex::encode(word.to_be_bytes::<32>()))
}

/// ABI `uint256` word of the integer part of `value`.
pub fn encode_uint256(value: Decimal) -> Result<String> {
    let integer = value.trunc();
    if integer < 0 {
        bail!("cannot encode negative value {value} as uint256");
    }
    Ok(encode_word(U256::from(integer.unsigned_abs())))
}

/// ABI `int256` word in two's complement.
pub fn encode_int256(integer: i128) -> String {
    let magnitude = U256::from(integer.unsigned_abs());
    let word = if integer < 0 {
        (!magnitude).wrapping_add(U256::from(1))
    } else {
        magnitude
    };
    encode_word(word)
}

/// Left-aligns a string's bytes (or an `0x` hex value) into a 32-byte word.
pub fn encode_bytes32(value: &Value) -> String {
    let raw: Vec<u8> = match value {
        Value::String(text) => match text.strip_prefix("0x").map(hex::decode) {
            Some(Ok(bytes)) => bytes,
            _ => text.as_bytes().to_vec(),
        },
        Value::Null => Vec::new(),
        other => other.to_string().into_bytes(),
    };
    let mut word = [0u8; 32];
    let len = raw.len().min(32);
    word[..len].copy_from_slice(&raw[..len]);
    format!("0x{}", hex::encode(word))
}

struct NoOpAdapter;

#[async_trait]
impl Adapter for NoOpAdapter {
    async fn perform(&self, input: TaskInput<'_>) -> TaskOutcome {
        TaskOutcome::completed(input.result.clone())
    }
}

/// Decodes a hex string result (as produced by the eth* encoders) into bytes.
pub fn result_bytes(result: &Value) -> Result<Bytes> {
    match result {
        Value::String(text) => {
            let digits = text.strip_prefix("0x").unwrap_or(text);
            hex::decode(digits)
                .map(Bytes::from)
                .with_context(|| format!("result {text:?} is not hex encoded"))
        }
        Value::Null => Ok(Bytes::new()),
        other => bail!("result {other} cannot be used as transaction data"),
    }
}
