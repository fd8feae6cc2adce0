//! Background task bookkeeping for a running node.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handles of the long-lived tasks spawned by `OracleNode::start`, all tied
/// to one run token.
pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl LifecycleHandles {
    pub(crate) fn new(shutdown_root: &CancellationToken) -> Self {
        Self {
            run_token: shutdown_root.child_token(),
            tasks: Vec::new(),
        }
    }

    pub(crate) fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        tracing::debug!(task = name, "background task started");
        self.tasks.push((name, handle));
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Cancels the run token and joins every task in start order.
    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();
        for (name, handle) in self.tasks.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(task = name, error = %err, "background task panicked");
            }
        }
    }
}
