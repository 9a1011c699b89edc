use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

use baton_core::{BatonError, Result};

/// Rolling window for the error-rate computation.
const ERROR_WINDOW: Duration = Duration::from_secs(300);
/// Rolling window for the cost-per-hour estimate.
const COST_WINDOW: Duration = Duration::from_secs(3600);
/// Calls below this count never open the circuit (avoids tripping on the
/// first failure of a cold key).
const MIN_SAMPLES: usize = 10;
/// Keys idle longer than this are swept.
const IDLE_EXPIRY: Duration = Duration::from_secs(86_400);

/// Tunables for the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Error-rate fraction over the rolling window that opens the circuit.
    pub error_rate: f64,
    /// Estimated USD per hour that opens the circuit.
    pub cost_per_hour: f64,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.2,
            cost_per_hour: 30.0,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    /// Cooldown elapsed — one probe allowed through.
    HalfOpen { probe_inflight: bool },
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// (at, is_error, cost) samples, pruned to the cost window.
    samples: VecDeque<(Instant, bool, f64)>,
    last_seen: Instant,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            samples: VecDeque::new(),
            last_seen: Instant::now(),
        }
    }

    fn prune(&mut self) {
        let cutoff = Instant::now() - COST_WINDOW;
        while self.samples.front().is_some_and(|(at, _, _)| *at < cutoff) {
            self.samples.pop_front();
        }
    }

    fn error_rate(&self) -> (usize, f64) {
        let cutoff = Instant::now() - ERROR_WINDOW;
        let recent: Vec<bool> = self
            .samples
            .iter()
            .filter(|(at, _, _)| *at >= cutoff)
            .map(|(_, err, _)| *err)
            .collect();
        if recent.is_empty() {
            return (0, 0.0);
        }
        let errors = recent.iter().filter(|e| **e).count();
        (recent.len(), errors as f64 / recent.len() as f64)
    }

    fn hourly_cost_estimate(&self) -> f64 {
        self.samples.iter().map(|(_, _, cost)| cost).sum()
    }
}

/// Circuit breaker keyed on `(function, user)` when the user is known, else
/// function-wide. Each entry carries its own lock via the dashmap shard.
pub struct BreakerRegistry {
    circuits: DashMap<String, Circuit>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
        }
    }

    fn key(function: &str, user: Option<&str>) -> String {
        match user {
            Some(user) => format!("{function}:{user}"),
            None => function.to_string(),
        }
    }

    /// Admit or reject a call. While open, rejects until the cooldown ends;
    /// then lets exactly one probe through.
    pub fn check(&self, function: &str, user: Option<&str>) -> Result<()> {
        let key = Self::key(function, user);
        let mut circuit = self.circuits.entry(key.clone()).or_insert_with(Circuit::new);
        circuit.last_seen = Instant::now();
        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    circuit.state = CircuitState::HalfOpen {
                        probe_inflight: true,
                    };
                    Ok(())
                } else {
                    let remaining = self.config.cooldown - since.elapsed();
                    Err(BatonError::CircuitOpen {
                        function: function.to_string(),
                        retry_after_secs: remaining.as_secs().max(1),
                    })
                }
            }
            CircuitState::HalfOpen { probe_inflight } => {
                if probe_inflight {
                    Err(BatonError::CircuitOpen {
                        function: function.to_string(),
                        retry_after_secs: 1,
                    })
                } else {
                    circuit.state = CircuitState::HalfOpen {
                        probe_inflight: true,
                    };
                    Ok(())
                }
            }
        }
    }

    /// Record a completed call and its cost.
    pub fn record_success(&self, function: &str, user: Option<&str>, cost: f64) {
        let key = Self::key(function, user);
        let mut circuit = self.circuits.entry(key).or_insert_with(Circuit::new);
        circuit.samples.push_back((Instant::now(), false, cost));
        circuit.prune();
        match circuit.state {
            CircuitState::HalfOpen { .. } => {
                circuit.state = CircuitState::Closed;
            }
            _ => {
                if circuit.hourly_cost_estimate() > self.config.cost_per_hour {
                    warn!(function, ?user, "circuit opened on cost");
                    circuit.state = CircuitState::Open {
                        since: Instant::now(),
                    };
                }
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, function: &str, user: Option<&str>) {
        let key = Self::key(function, user);
        let mut circuit = self.circuits.entry(key).or_insert_with(Circuit::new);
        circuit.samples.push_back((Instant::now(), true, 0.0));
        circuit.prune();
        match circuit.state {
            CircuitState::HalfOpen { .. } => {
                // Probe failed — back to open.
                circuit.state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
            CircuitState::Closed => {
                let (samples, rate) = circuit.error_rate();
                if samples >= MIN_SAMPLES && rate > self.config.error_rate {
                    warn!(function, ?user, rate, "circuit opened on error rate");
                    circuit.state = CircuitState::Open {
                        since: Instant::now(),
                    };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Drop keys idle for more than a day. Run from a background task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.circuits
            .retain(|_, c| now.duration_since(c.last_seen) < IDLE_EXPIRY);
    }

    #[cfg(test)]
    fn force_open_elapsed(&self, function: &str, user: Option<&str>) {
        let key = Self::key(function, user);
        if let Some(mut c) = self.circuits.get_mut(&key) {
            c.state = CircuitState::Open {
                since: Instant::now() - Duration::from_secs(10_000),
            };
        }
    }
}
