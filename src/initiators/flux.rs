//! Flux monitor: polls price feeds and starts a run whenever the median
//! moves far enough from the last submitted answer, when the idle timer
//! elapses without a submission, or when another oracle opens a round on
//! the aggregator.

use crate::chain::{Log, LogFilter};
use crate::jobs::decimal::Decimal;
use crate::jobs::run::RunRequest;
use crate::jobs::runner::RunManager;
use crate::jobs::spec::FluxMonitorParams;
use crate::logs::LogListener;
use alloy_primitives::{keccak256, Address, B256, U256};
use anyhow::{bail, Context, Result};
use futures::future::{join_all, BoxFuture};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// `NewRound(uint256 indexed roundId, address indexed startedBy, uint256 startedAt)`
pub static NEW_ROUND_TOPIC: Lazy<B256> =
    Lazy::new(|| keccak256("NewRound(uint256,address,uint256)"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRound {
    pub round: u64,
    pub started_by: Address,
}

impl NewRound {
    pub fn from_log(log: &Log) -> Option<Self> {
        if log.topics.first() != Some(&*NEW_ROUND_TOPIC) {
            return None;
        }
        let round = U256::from_be_bytes(log.topics.get(1)?.0);
        Some(Self {
            round: u64::try_from(round).ok()?,
            started_by: Address::from_word(*log.topics.get(2)?),
        })
    }
}

/// Forwards `NewRound` logs from the aggregator to the job's monitor.
pub struct NewRoundListener {
    id: String,
    filter: LogFilter,
    rounds: mpsc::UnboundedSender<NewRound>,
}

impl NewRoundListener {
    pub fn new(job_id: Uuid, aggregator: Address, rounds: mpsc::UnboundedSender<NewRound>) -> Self {
        Self {
            id: format!("fluxmonitor:{job_id}"),
            filter: LogFilter::any()
                .with_address(aggregator)
                .with_topic(0, vec![*NEW_ROUND_TOPIC]),
            rounds,
        }
    }
}

impl LogListener for NewRoundListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn filter(&self) -> &LogFilter {
        &self.filter
    }

    fn min_confirmations(&self) -> u64 {
        0
    }

    fn handle_log<'a>(&'a self, log: &'a Log) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match NewRound::from_log(log) {
                Some(round) => {
                    if self.rounds.send(round).is_err() {
                        tracing::debug!(listener = %self.id, "flux monitor gone; new round dropped");
                    }
                }
                None => {
                    tracing::warn!(listener = %self.id, tx_hash = %log.tx_hash, "malformed NewRound log");
                }
            }
            Ok(())
        })
    }
}

pub struct FluxMonitor {
    job_id: Uuid,
    params: FluxMonitorParams,
    runs: RunManager,
    http: reqwest::Client,
    timeout: Duration,
    own_address: Address,
    /// Round the next submission answers.
    next_round: u64,
    last_submitted: Option<Decimal>,
}

impl FluxMonitor {
    pub fn new(
        job_id: Uuid,
        params: FluxMonitorParams,
        runs: RunManager,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            job_id,
            params,
            own_address: runs.settings().from_address,
            runs,
            http,
            timeout,
            next_round: 1,
            last_submitted: None,
        }
    }

    pub async fn run(
        mut self,
        mut rounds: mpsc::UnboundedReceiver<NewRound>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = time::interval(self.params.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut idle_deadline = self.params.idle_timer.map(|idle| Instant::now() + idle);

        loop {
            let idle_at = idle_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(Some(answer)) if self.should_submit(&answer) => {
                            if self.submit(answer).await {
                                idle_deadline = self.params.idle_timer.map(|idle| Instant::now() + idle);
                            }
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(job_id = %self.job_id, error = %err, "flux monitor poll failed"),
                    }
                }
                Some(new_round) = rounds.recv() => {
                    if self.answer_round(new_round).await {
                        idle_deadline = self.params.idle_timer.map(|idle| Instant::now() + idle);
                    }
                }
                _ = time::sleep_until(idle_at), if idle_deadline.is_some() => {
                    let answer = match self.poll().await {
                        Ok(Some(answer)) => Some(answer),
                        Ok(None) => self.last_submitted,
                        Err(err) => {
                            tracing::warn!(job_id = %self.job_id, error = %err, "flux monitor idle poll failed");
                            self.last_submitted
                        }
                    };
                    if let Some(answer) = answer {
                        tracing::info!(job_id = %self.job_id, "flux monitor idle timer elapsed");
                        self.submit(answer).await;
                    }
                    idle_deadline = self.params.idle_timer.map(|idle| Instant::now() + idle);
                }
            }
        }

        tracing::debug!(job_id = %self.job_id, "flux monitor stopped");
    }

    /// Answers a round another oracle opened, whatever the deviation.
    async fn answer_round(&mut self, new_round: NewRound) -> bool {
        if new_round.started_by == self.own_address {
            tracing::debug!(job_id = %self.job_id, round = new_round.round, "ignoring round we started");
            return false;
        }
        if new_round.round < self.next_round {
            tracing::debug!(job_id = %self.job_id, round = new_round.round, next = self.next_round, "round already answered");
            return false;
        }
        tracing::info!(job_id = %self.job_id, round = new_round.round, started_by = %new_round.started_by, "new round opened");
        self.next_round = new_round.round;
        match self.poll().await {
            Ok(Some(answer)) => self.submit(answer).await,
            Ok(None) => {
                tracing::warn!(job_id = %self.job_id, round = new_round.round, "no feed answered for new round");
                false
            }
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "flux monitor poll failed");
                false
            }
        }
    }

    fn should_submit(&self, answer: &Decimal) -> bool {
        match &self.last_submitted {
            None => true,
            Some(last) => last.percent_change_to(answer) >= self.params.threshold,
        }
    }

    /// Median of every feed that answered, or `None` when none did.
    async fn poll(&self) -> Result<Option<Decimal>> {
        let answers = join_all(self.params.feeds.iter().map(|feed| self.fetch(feed))).await;
        let mut values = Vec::with_capacity(answers.len());
        for (feed, answer) in self.params.feeds.iter().zip(answers) {
            match answer {
                Ok(value) => values.push(value),
                Err(err) => tracing::warn!(job_id = %self.job_id, %feed, error = %err, "price feed failed"),
            }
        }
        median(values)
    }

    async fn fetch(&self, feed: &url::Url) -> Result<Decimal> {
        let response = self
            .http
            .post(feed.clone())
            .timeout(self.timeout)
            .json(&json!({"id": self.job_id, "data": {}}))
            .send()
            .await
            .with_context(|| format!("feed {feed} unreachable"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("feed {feed} returned {status}");
        }
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("feed {feed} returned malformed JSON"))?;
        let result = body
            .pointer("/data/result")
            .or_else(|| body.get("result"))
            .unwrap_or(&body);
        Decimal::from_json(result).with_context(|| format!("feed {feed} answer"))
    }

    async fn submit(&mut self, answer: Decimal) -> bool {
        let round = self.next_round;
        let params = json!({
            "result": answer.to_string(),
            "address": self.params.address,
            "functionSelector": self.params.function_selector,
            "dataPrefix": round_word(round),
        });
        match self
            .runs
            .spawn_run(self.job_id, RunRequest::new("fluxmonitor", params))
            .await
        {
            Ok(run) => {
                tracing::info!(job_id = %self.job_id, run_id = %run.id, round, answer = %answer, "flux monitor submitted answer");
                self.last_submitted = Some(answer);
                self.next_round += 1;
                true
            }
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, round, error = %err, "flux monitor could not start run");
                false
            }
        }
    }
}

/// Round id as a 32-byte big-endian word.
fn round_word(round: u64) -> String {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&round.to_be_bytes());
    format!("0x{}", hex::encode(word))
}

fn median(mut values: Vec<Decimal>) -> Result<Option<Decimal>> {
    if values.is_empty() {
        return Ok(None);
    }
    values.sort_by(|a, b| a.to_f64().total_cmp(&b.to_f64()));
    let middle = values.len() / 2;
    if values.len() % 2 == 1 {
        return Ok(Some(values[middle]));
    }
    let mean = (values[middle - 1].to_f64() + values[middle].to_f64()) / 2.0;
    Decimal::from_str(&mean.to_string()).map(Some)
}
