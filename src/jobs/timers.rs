use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

enum Command {
    Arm { run_id: Uuid, at: DateTime<Utc> },
    Disarm { run_id: Uuid },
}

/// Wall-clock deadlines for sleeping runs, served by a single task. Each
/// parked run costs one map entry; when its deadline passes the run id is
/// sent on the `fired` channel handed to [`DeadlineQueue::spawn`].
#[derive(Clone)]
pub struct DeadlineQueue {
    commands: mpsc::UnboundedSender<Command>,
}

impl DeadlineQueue {
    pub fn spawn(
        fired: mpsc::UnboundedSender<Uuid>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(receiver, fired, shutdown));
        (Self { commands }, handle)
    }

    /// Re-arming a run replaces its previous deadline.
    pub fn arm(&self, run_id: Uuid, at: DateTime<Utc>) {
        if self.commands.send(Command::Arm { run_id, at }).is_err() {
            tracing::warn!(%run_id, "deadline queue stopped; sleep not armed");
        }
    }

    pub fn disarm(&self, run_id: Uuid) {
        let _ = self.commands.send(Command::Disarm { run_id });
    }
}

#[derive(Default)]
struct Deadlines {
    by_instant: BTreeMap<Instant, Vec<Uuid>>,
    by_run: HashMap<Uuid, Instant>,
}

impl Deadlines {
    fn arm(&mut self, run_id: Uuid, at: DateTime<Utc>) {
        self.disarm(run_id);
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let instant = Instant::now() + delay;
        self.by_instant.entry(instant).or_default().push(run_id);
        self.by_run.insert(run_id, instant);
    }

    fn disarm(&mut self, run_id: Uuid) {
        let Some(instant) = self.by_run.remove(&run_id) else {
            return;
        };
        if let Some(runs) = self.by_instant.get_mut(&instant) {
            runs.retain(|existing| *existing != run_id);
            if runs.is_empty() {
                self.by_instant.remove(&instant);
            }
        }
    }

    fn next(&self) -> Option<Instant> {
        self.by_instant.keys().next().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<Uuid> {
        let later = self.by_instant.split_off(&(now + std::time::Duration::from_nanos(1)));
        let due = std::mem::replace(&mut self.by_instant, later);
        let runs: Vec<Uuid> = due.into_values().flatten().collect();
        for run_id in &runs {
            self.by_run.remove(run_id);
        }
        runs
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    fired: mpsc::UnboundedSender<Uuid>,
    shutdown: CancellationToken,
) {
    let mut deadlines = Deadlines::default();

    loop {
        let next = deadlines.next();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Arm { run_id, at }) => deadlines.arm(run_id, at),
                Some(Command::Disarm { run_id }) => deadlines.disarm(run_id),
                None => break,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                for run_id in deadlines.take_due(Instant::now()) {
                    if fired.send(run_id).is_err() {
                        tracing::warn!(%run_id, "deadline consumer gone");
                    }
                }
            }
        }
    }

    tracing::info!(parked = deadlines.by_run.len(), "deadline queue stopped");
}
