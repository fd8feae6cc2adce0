//! Ordered head delivery to registered subscribers. Each call is bounded by
//! a budget and isolated: an error, timeout, or panic in one subscriber is
//! logged and the next subscriber still sees the head.

use crate::chain::{BlockRef, Head};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgInfo {
    /// Highest block shared by the old and new branch.
    pub common_ancestor: u64,
    /// Number of canonical blocks that were replaced.
    pub depth: u64,
    pub replaced: Vec<BlockRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadEvent {
    pub head: Head,
    /// Set on the first head of a new branch.
    pub reorg: Option<ReorgInfo>,
}

impl HeadEvent {
    pub fn new(head: Head) -> Self {
        Self { head, reorg: None }
    }
}

pub trait HeadSubscriber: Send + Sync {
    fn name(&self) -> &str;

    fn on_new_head<'a>(&'a self, event: &'a HeadEvent) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug)]
pub(crate) enum CallOutcome {
    Ok,
    Failed(anyhow::Error),
    TimedOut,
    Panicked(String),
}

/// Awaits `fut` for at most `budget`, converting panics into an outcome.
pub(crate) async fn guarded_call<F>(budget: Duration, fut: F) -> CallOutcome
where
    F: Future<Output = Result<()>>,
{
    match timeout(budget, AssertUnwindSafe(fut).catch_unwind()).await {
        Err(_) => CallOutcome::TimedOut,
        Ok(Err(payload)) => CallOutcome::Panicked(panic_message(payload.as_ref())),
        Ok(Ok(Err(err))) => CallOutcome::Failed(err),
        Ok(Ok(Ok(()))) => CallOutcome::Ok,
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct HeadFanout {
    subscribers: RwLock<Vec<Arc<dyn HeadSubscriber>>>,
    budget: Duration,
    telemetry: Arc<Telemetry>,
}

impl HeadFanout {
    pub fn new(budget: Duration, telemetry: Arc<Telemetry>) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            budget,
            telemetry,
        }
    }

    /// Subscribers are called in registration order.
    pub fn register(&self, subscriber: Arc<dyn HeadSubscriber>) {
        tracing::debug!(subscriber = subscriber.name(), "registered head subscriber");
        self.subscribers
            .write()
            .expect("head subscriber registry poisoned")
            .push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .expect("head subscriber registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn publish(&self, event: &HeadEvent) {
        let subscribers = self
            .subscribers
            .read()
            .expect("head subscriber registry poisoned")
            .clone();

        for subscriber in subscribers {
            let outcome = guarded_call(self.budget, subscriber.on_new_head(event)).await;
            let head = event.head.number;
            match outcome {
                CallOutcome::Ok => continue,
                CallOutcome::Failed(err) => {
                    tracing::warn!(subscriber = subscriber.name(), head, error = %err, "head subscriber failed");
                }
                CallOutcome::TimedOut => {
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        head,
                        budget_ms = self.budget.as_millis() as u64,
                        "head subscriber exceeded its call budget"
                    );
                }
                CallOutcome::Panicked(panic) => {
                    tracing::error!(subscriber = subscriber.name(), head, panic = %panic, "head subscriber panicked");
                }
            }
            self.telemetry.record_subscriber_failure();
        }
    }
}
