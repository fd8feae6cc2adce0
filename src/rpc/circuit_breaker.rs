//! Closed/Open/Half-Open breaker guarding the chain RPC endpoint so a dead
//! node is not hammered by every head, receipt, and nonce lookup at once.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_FAILURE_THRESHOLD: usize = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_HALF_OPEN_PROBES: usize = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("chain rpc circuit breaker is open")]
    CircuitOpen,
}

#[derive(Debug, Copy, Clone)]
struct BreakerSettings {
    failure_threshold: usize,
    cooldown: Duration,
    half_open_probes: usize,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probes_in_flight: usize,
}

impl BreakerState {
    fn open(&mut self) {
        self.opened_at = Some(Instant::now());
        self.probes_in_flight = 0;
        self.move_to(CircuitState::Open);
    }

    fn move_to(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        tracing::warn!(
            previous = ?self.state,
            next = ?next,
            consecutive_failures = self.consecutive_failures,
            "chain rpc circuit breaker state changed"
        );
        self.state = next;
    }
}

#[derive(Debug, Clone)]
pub struct RpcCircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    settings: BreakerSettings,
}

impl Default for RpcCircuitBreaker {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_COOLDOWN,
            DEFAULT_HALF_OPEN_PROBES,
        )
    }
}

impl RpcCircuitBreaker {
    /// Zero values are clamped: at least one failure opens the breaker, the
    /// cooldown is at least one second, and at least one probe is admitted.
    pub fn new(failure_threshold: usize, cooldown: Duration, half_open_probes: usize) -> Self {
        let cooldown = if cooldown.is_zero() {
            Duration::from_secs(1)
        } else {
            cooldown
        };

        Self {
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
            })),
            settings: BreakerSettings {
                failure_threshold: failure_threshold.max(1),
                cooldown,
                half_open_probes: half_open_probes.max(1),
            },
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let guard = self.state.lock().expect("circuit breaker mutex poisoned");
        CircuitBreakerSnapshot {
            state: guard.state,
            consecutive_failures: guard.consecutive_failures,
            opened_at: guard.opened_at,
        }
    }

    /// Admits or rejects the next RPC attempt. In Half-Open only
    /// `half_open_probes` attempts may be outstanding at once.
    pub fn before_request(&self) -> Result<CircuitState, CircuitBreakerError> {
        let mut guard = self.state.lock().expect("circuit breaker mutex poisoned");

        if guard.state == CircuitState::Open {
            let cooled = guard
                .opened_at
                .map(|opened| opened.elapsed() >= self.settings.cooldown)
                .unwrap_or(false);
            if !cooled {
                return Err(CircuitBreakerError::CircuitOpen);
            }
            guard.probes_in_flight = 0;
            guard.move_to(CircuitState::HalfOpen);
        }

        if guard.state == CircuitState::HalfOpen {
            if guard.probes_in_flight >= self.settings.half_open_probes {
                return Err(CircuitBreakerError::CircuitOpen);
            }
            guard.probes_in_flight += 1;
        }

        Ok(guard.state)
    }

    pub fn record_success(&self) {
        let mut guard = self.state.lock().expect("circuit breaker mutex poisoned");
        guard.probes_in_flight = guard.probes_in_flight.saturating_sub(1);
        guard.consecutive_failures = 0;
        if guard.state == CircuitState::HalfOpen {
            guard.opened_at = None;
            guard.move_to(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut guard = self.state.lock().expect("circuit breaker mutex poisoned");
        guard.probes_in_flight = guard.probes_in_flight.saturating_sub(1);
        guard.consecutive_failures = guard.consecutive_failures.saturating_add(1);

        match guard.state {
            CircuitState::HalfOpen => guard.open(),
            CircuitState::Closed
                if guard.consecutive_failures >= self.settings.failure_threshold =>
            {
                guard.open()
            }
            _ => {}
        }
    }
}
