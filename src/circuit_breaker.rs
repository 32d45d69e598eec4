//! Per-provider circuit breaker.
//!
//! State machine: `closed -> open -> half_open -> {closed|open}`. The
//! open -> half_open transition is lazy: there is no background timer, it is
//! observed the next time admission is checked, via [`CircuitBreaker::state`].
//!
//! A second, independent cooldown — the rate-limit cooldown — blocks
//! admission until a timestamp regardless of circuit state. The candidate
//! pool checks both `can_attempt` and the cooldown before treating a
//! provider as eligible.

use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::health::{CircuitState, HealthStore};
use crate::provider::ProviderId;

pub const FAILURE_THRESHOLD: u32 = 3;
pub const COOLDOWN_BASE: Duration = Duration::from_secs(2 * 60);
pub const COOLDOWN_MAX: Duration = Duration::from_secs(10 * 60);
pub const COOLDOWN_MULTIPLIER: f64 = 1.5;

/// Tunables for a `CircuitBreaker`. Defaults match the constants above;
/// overriding is mostly useful in tests that want a tighter threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::duration_serde")]
    pub cooldown_base: Duration,
    #[serde(with = "crate::duration_serde")]
    pub cooldown_max: Duration,
    pub cooldown_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            cooldown_base: COOLDOWN_BASE,
            cooldown_max: COOLDOWN_MAX,
            cooldown_multiplier: COOLDOWN_MULTIPLIER,
        }
    }
}

struct ProviderCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    cooldown_until: Option<SystemTime>,
    circuit_opened_at: Option<SystemTime>,
    rate_limit_cooldown_until: Option<SystemTime>,
}

impl Default for ProviderCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            cooldown_until: None,
            circuit_opened_at: None,
            rate_limit_cooldown_until: None,
        }
    }
}

/// Process-wide circuit breaker, one logical state machine per provider,
/// backed by a sharded map so concurrent requests against different
/// providers never contend.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<ProviderId, ProviderCircuit>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Apply the lazy `open -> half_open` transition if the cooldown has
    /// elapsed, and report the (possibly just-updated) state.
    pub fn state(&self, id: &str, health: &HealthStore) -> CircuitState {
        let mut circuit = self
            .circuits
            .entry(id.to_string())
            .or_default();

        if circuit.state == CircuitState::Open {
            if let Some(until) = circuit.cooldown_until {
                if SystemTime::now() >= until {
                    circuit.state = CircuitState::HalfOpen;
                    health.set_circuit_state(id, CircuitState::HalfOpen, circuit.circuit_opened_at);
                }
            }
        }
        circuit.state
    }

    /// `canAttempt`: false iff the circuit is open at the moment of the
    /// check, after applying the lazy cooldown transition. Does not
    /// consider the separate rate-limit cooldown — callers that need both
    /// checks (the candidate pool) call [`CircuitBreaker::has_active_cooldown`]
    /// as well.
    pub fn can_attempt(&self, id: &str, health: &HealthStore) -> bool {
        self.state(id, health) != CircuitState::Open
    }

    pub fn has_active_cooldown(&self, id: &str) -> bool {
        let circuit = self.circuits.entry(id.to_string()).or_default();
        matches!(circuit.rate_limit_cooldown_until, Some(until) if SystemTime::now() < until)
    }

    /// `half_open -> closed` on any success; closed stays closed. Either
    /// way the consecutive-failure counter clears.
    pub fn record_success(&self, id: &str, health: &HealthStore) {
        let mut circuit = self.circuits.entry(id.to_string()).or_default();
        circuit.consecutive_failures = 0;
        if circuit.state != CircuitState::Closed {
            circuit.state = CircuitState::Closed;
            circuit.cooldown_until = None;
            circuit.circuit_opened_at = None;
            health.set_circuit_state(id, CircuitState::Closed, None);
        }
    }

    /// `closed -> open` once `consecutive_failures` reaches the threshold;
    /// `half_open -> open` on any probe failure (the counter continues
    /// from wherever it was, it is not reset on entering half_open).
    pub fn record_failure(&self, id: &str, health: &HealthStore) {
        let mut circuit = self.circuits.entry(id.to_string()).or_default();
        circuit.consecutive_failures += 1;

        let should_open = circuit.state == CircuitState::HalfOpen
            || circuit.consecutive_failures >= self.config.failure_threshold;

        if should_open {
            let over = circuit
                .consecutive_failures
                .saturating_sub(self.config.failure_threshold);
            let cooldown = scaled_cooldown(
                self.config.cooldown_base,
                self.config.cooldown_multiplier,
                over,
                self.config.cooldown_max,
            );
            let now = SystemTime::now();
            circuit.state = CircuitState::Open;
            circuit.cooldown_until = Some(now + cooldown);
            circuit.circuit_opened_at = Some(now);
            health.set_circuit_state(id, CircuitState::Open, Some(now));
            health.set_cooldown(id, circuit.cooldown_until);
        }
    }

    /// Apply a rate-limit-driven cooldown independent of circuit state.
    /// `retry_after` is the upstream-provided hint, if any; falls back to
    /// `cooldown_base` and is capped at `cooldown_max` either way.
    pub fn apply_rate_limit_cooldown(&self, id: &str, retry_after: Option<Duration>, health: &HealthStore) {
        let mut circuit = self.circuits.entry(id.to_string()).or_default();
        let requested = retry_after.unwrap_or(self.config.cooldown_base);
        let capped = requested.min(self.config.cooldown_max);
        let until = SystemTime::now() + capped;
        circuit.rate_limit_cooldown_until = Some(until);
        health.set_cooldown(id, Some(until));
    }

    /// Operator reset: clears consecutive failures, closes the circuit,
    /// clears both cooldowns.
    pub fn reset(&self, id: &str, health: &HealthStore) {
        self.circuits.insert(id.to_string(), ProviderCircuit::default());
        health.set_circuit_state(id, CircuitState::Closed, None);
        health.set_cooldown(id, None);
    }
}

fn scaled_cooldown(base: Duration, multiplier: f64, exponent: u32, cap: Duration) -> Duration {
    let scaled_secs = base.as_secs_f64() * multiplier.powi(exponent as i32);
    let scaled = Duration::from_secs_f64(scaled_secs.max(0.0));
    scaled.min(cap)
}
