use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        /// Monotonic counters for the node's moving parts.
        #[derive(Default, Debug)]
        pub struct Telemetry {
            $($field: AtomicU64,)*
        }

        impl Telemetry {
            $(
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> TelemetrySnapshot {
                TelemetrySnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }

        #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
        pub struct TelemetrySnapshot {
            $(pub $field: u64,)*
        }
    };
}

counters! {
    heads_received => record_head_received,
    heads_accepted => record_head_accepted,
    reorgs => record_reorg,
    subscriber_failures => record_subscriber_failure,
    logs_delivered => record_log_delivered,
    txs_created => record_tx_created,
    attempts_broadcast => record_attempt_broadcast,
    gas_bumps => record_gas_bump,
    txs_confirmed => record_tx_confirmed,
    runs_created => record_run_created,
    runs_completed => record_run_completed,
    runs_errored => record_run_errored,
    runs_cancelled => record_run_cancelled,
    backfilled_heads => record_backfilled_head,
}

impl Telemetry {
    pub fn record_backfilled_heads(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.backfilled_heads.fetch_add(count, Ordering::Relaxed);
    }
}

/// Spawns a background task that periodically logs head, transaction and run counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "oracleblock::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let new_heads = current.heads_accepted.saturating_sub(last_snapshot.heads_accepted);
                    let runs_finished = (current.runs_completed + current.runs_errored + current.runs_cancelled)
                        .saturating_sub(last_snapshot.runs_completed + last_snapshot.runs_errored + last_snapshot.runs_cancelled);

                    tracing::info!(
                        target: "oracleblock::metrics",
                        new_heads,
                        heads_accepted = current.heads_accepted,
                        reorgs = current.reorgs,
                        backfilled_heads = current.backfilled_heads,
                        subscriber_failures = current.subscriber_failures,
                        logs_delivered = current.logs_delivered,
                        txs_created = current.txs_created,
                        attempts_broadcast = current.attempts_broadcast,
                        gas_bumps = current.gas_bumps,
                        txs_confirmed = current.txs_confirmed,
                        runs_created = current.runs_created,
                        runs_finished,
                        runs_errored = current.runs_errored,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                }
            }
        }
    })
}
