//! Per-provider health tracking: EWMA latency, success/failure counters,
//! derived score and status classification.
//!
//! One [`ProviderHealth`] row exists per registered provider for the
//! lifetime of the process; [`HealthStore`] owns the map and serializes
//! updates per-provider under `dashmap`'s sharded locking, matching the
//! concurrency model the circuit breaker and candidate pool both rely on.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderId;

/// Smoothing factor for the latency EWMA.
const LATENCY_ALPHA: f64 = 0.2;
/// Latency penalty denominator. Canonical per the score formula; see
/// DESIGN.md "Open Question Decisions" for why there is no second,
/// divergent call site in this implementation.
const LATENCY_PENALTY_DENOMINATOR: f64 = 10_000.0;
const LATENCY_PENALTY_CAP: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    Degraded,
    Poor,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub score: f64,
    pub latency_ewma_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error_kind: Option<String>,
    pub circuit_state: CircuitState,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub circuit_opened_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub cooldown_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            score: 1.0,
            latency_ewma_ms: 0.0,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error_kind: None,
            circuit_state: CircuitState::Closed,
            circuit_opened_at: None,
            cooldown_until: None,
        }
    }
}

impl ProviderHealth {
    /// `score = clamp(rate * (1 - penalty), 0, 1)` where `rate` is the
    /// success ratio (1.0 with no requests yet) and `penalty` caps the
    /// latency contribution at 0.5.
    fn recompute_score(&mut self) {
        let total = self.success_count + self.failure_count;
        let rate = if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        };
        let penalty = (self.latency_ewma_ms / LATENCY_PENALTY_DENOMINATOR).min(LATENCY_PENALTY_CAP);
        self.score = (rate * (1.0 - penalty)).clamp(0.0, 1.0);
    }

    fn apply_latency(&mut self, latency_ms: f64) {
        self.latency_ewma_ms = LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * self.latency_ewma_ms;
    }

    pub fn status(&self) -> HealthStatus {
        if self.score >= 0.9 {
            HealthStatus::Excellent
        } else if self.score >= 0.7 {
            HealthStatus::Good
        } else if self.score >= 0.5 {
            HealthStatus::Degraded
        } else if self.score >= 0.3 {
            HealthStatus::Poor
        } else {
            HealthStatus::Unavailable
        }
    }
}

/// Process-wide map of `ProviderId -> ProviderHealth`, plus the separate
/// consecutive-failure counters the circuit breaker drives off of.
///
/// The consecutive-failure counter lives on the circuit breaker's own state
/// rather than on [`ProviderHealth`]: it drives the open transition and is
/// never part of the persisted health record.
pub struct HealthStore {
    records: DashMap<ProviderId, ProviderHealth>,
}

impl HealthStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Create a health row for a newly registered provider. Idempotent: a
    /// provider that already has a row is left untouched.
    pub fn ensure_registered(&self, id: &str) {
        self.records
            .entry(id.to_string())
            .or_insert_with(ProviderHealth::default);
    }

    pub fn get(&self, id: &str) -> Option<ProviderHealth> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn snapshot(&self) -> HashMap<ProviderId, ProviderHealth> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn record_success(&self, id: &str, latency_ms: Duration) {
        if let Some(mut row) = self.records.get_mut(id) {
            row.apply_latency(latency_ms.as_millis() as f64);
            row.success_count += 1;
            row.last_success_at = Some(chrono::Utc::now());
            row.recompute_score();
        }
    }

    pub fn record_failure(&self, id: &str, latency_ms: Duration, error_kind: &str) {
        if let Some(mut row) = self.records.get_mut(id) {
            row.apply_latency(latency_ms.as_millis() as f64);
            row.failure_count += 1;
            row.last_failure_at = Some(chrono::Utc::now());
            row.last_error_kind = Some(error_kind.to_string());
            row.recompute_score();
        }
    }

    pub fn set_circuit_state(&self, id: &str, state: CircuitState, opened_at: Option<SystemTime>) {
        if let Some(mut row) = self.records.get_mut(id) {
            row.circuit_state = state;
            row.circuit_opened_at = opened_at.map(chrono::DateTime::<chrono::Utc>::from);
        }
    }

    pub fn set_cooldown(&self, id: &str, until: Option<SystemTime>) {
        if let Some(mut row) = self.records.get_mut(id) {
            row.cooldown_until = until.map(chrono::DateTime::<chrono::Utc>::from);
        }
    }

    /// Operator reset: clears counters, score back to 1.0, circuit closed,
    /// cooldown cleared.
    pub fn reset(&self, id: &str) {
        self.records.insert(id.to_string(), ProviderHealth::default());
    }
}

impl Default for HealthStore {
    fn default() -> Self {
        Self::new()
    }
}
