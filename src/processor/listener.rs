//! Polling head subscription feeding the head tracker.

use super::backoff::{sleep_with_cancellation, ReconnectBackoff};
use super::head_tracker::HeadTracker;
use crate::chain::ChainClient;
use alloy_primitives::B256;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub poll_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

pub(crate) struct HeadListener;

impl HeadListener {
    /// Polls `latest_head` and hands every new hash to the tracker. Failed
    /// polls mark the subscription disconnected and back off; the first
    /// successful poll afterwards lets the tracker backfill the gap.
    pub(crate) fn spawn(
        chain: Arc<dyn ChainClient>,
        tracker: Arc<HeadTracker>,
        settings: ListenerSettings,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut backoff =
                ReconnectBackoff::new(settings.reconnect_initial, settings.reconnect_max);
            let mut last_seen: Option<B256> = None;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        match chain.latest_head().await {
                            Ok(head) => {
                                if !tracker.set_connected(true) {
                                    tracing::info!(
                                        head = head.number,
                                        failures = backoff.failures(),
                                        "head subscription established"
                                    );
                                    backoff.reset();
                                }
                                if last_seen == Some(head.hash) {
                                    continue;
                                }
                                last_seen = Some(head.hash);

                                let number = head.number;
                                if let Err(err) = tracker.on_new_head(head).await {
                                    tracing::warn!(head = number, error = %err, "failed to process new head");
                                    last_seen = None;
                                }
                            }
                            Err(err) => {
                                if tracker.set_connected(false) {
                                    tracing::warn!(error = %err, "head subscription lost");
                                }
                                let delay = backoff.next_delay();
                                tracing::warn!(
                                    error = %err,
                                    failures = backoff.failures(),
                                    retry_in_ms = delay.as_millis() as u64,
                                    "failed to poll latest head; reconnecting"
                                );
                                if sleep_with_cancellation(delay, Some(&shutdown)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            tracker.set_connected(false);
            tracing::info!("head listener stopped");
        })
    }
}
