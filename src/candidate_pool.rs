//! Candidate selection: eligibility filtering, weight assignment, and
//! weighted-random sampling with an anti-repeat penalty.
//!
//! Weighting mixes health, configured priority, and a random component so
//! that no single signal dominates selection forever; the anti-repeat
//! multiplier then suppresses a conversation's most recently used providers
//! without excluding them outright.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreaker;
use crate::external::{CredentialStore, ProviderDescriptorStore};
use crate::health::HealthStore;
use crate::provider::ProviderId;
use crate::registry::ProviderRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePoolConfig {
    pub health_weight: f64,
    pub priority_weight: f64,
    pub random_weight: f64,
    /// Multipliers applied to the most-recent, second-most-recent, and
    /// third-most-recent provider in the anti-repeat window, in that order.
    pub anti_repeat_multipliers: [f64; 3],
}

impl Default for CandidatePoolConfig {
    fn default() -> Self {
        Self {
            health_weight: 0.30,
            priority_weight: 0.20,
            random_weight: 0.50,
            anti_repeat_multipliers: [0.2, 0.5, 0.7],
        }
    }
}

/// A provider that passed eligibility for the current selection round, with
/// its sampling weight already computed.
#[derive(Debug, Clone)]
pub struct CandidateProvider {
    pub id: ProviderId,
    pub display_name: String,
    pub priority: u8,
    pub health_score: f64,
    pub weight: f64,
}

pub struct SelectionInput {
    pub exclude_providers: Vec<ProviderId>,
    pub recent_providers: Vec<ProviderId>,
}

pub struct CandidatePool<'a> {
    registry: &'a ProviderRegistry,
    descriptors: &'a dyn ProviderDescriptorStore,
    credentials: &'a dyn CredentialStore,
    health: &'a HealthStore,
    circuit_breaker: &'a CircuitBreaker,
    config: CandidatePoolConfig,
}

impl<'a> CandidatePool<'a> {
    pub fn new(
        registry: &'a ProviderRegistry,
        descriptors: &'a dyn ProviderDescriptorStore,
        credentials: &'a dyn CredentialStore,
        health: &'a HealthStore,
        circuit_breaker: &'a CircuitBreaker,
        config: CandidatePoolConfig,
    ) -> Self {
        Self {
            registry,
            descriptors,
            credentials,
            health,
            circuit_breaker,
            config,
        }
    }

    /// Build the eligible candidate list with weights assigned, for one
    /// selection round. `rng` drives the random weight component.
    pub async fn get(&self, input: &SelectionInput, rng: &mut impl Rng) -> Vec<CandidateProvider> {
        let mut candidates = Vec::new();
        for descriptor in self.descriptors.list().await {
            if !descriptor.enabled || !self.registry.has(&descriptor.id) {
                continue;
            }
            if self.credentials.get_key(&descriptor.id).await.is_none() {
                continue;
            }
            if input.exclude_providers.contains(&descriptor.id) {
                continue;
            }
            if !self.circuit_breaker.can_attempt(&descriptor.id, self.health) {
                continue;
            }
            if self.circuit_breaker.has_active_cooldown(&descriptor.id) {
                continue;
            }
            let Some(health) = self.health.get(&descriptor.id) else {
                continue;
            };

            let priority_w = descriptor.priority as f64 / 100.0;
            let random_w = 0.5 + rng.gen::<f64>() * 0.5;
            let base = self.config.health_weight * health.score
                + self.config.priority_weight * priority_w
                + self.config.random_weight * random_w;
            let anti_mult = self.anti_repeat_multiplier(&descriptor.id, &input.recent_providers);

            candidates.push(CandidateProvider {
                id: descriptor.id.clone(),
                display_name: descriptor.display_name.clone(),
                priority: descriptor.priority,
                health_score: health.score,
                weight: base * anti_mult,
            });
        }
        candidates
    }

    /// Window of the last 3 entries in `recent` (most recent last).
    pub fn anti_repeat_multiplier(&self, id: &str, recent: &[ProviderId]) -> f64 {
        let window: Vec<&ProviderId> = recent.iter().rev().take(3).collect();
        match window.iter().position(|p| p.as_str() == id) {
            Some(0) => self.config.anti_repeat_multipliers[0],
            Some(1) => self.config.anti_repeat_multipliers[1],
            Some(2) => self.config.anti_repeat_multipliers[2],
            _ => 1.0,
        }
    }

    /// Standard weighted-random selection. Empty input returns `None`; a
    /// zero weight sum falls back to a uniform pick; a single candidate is
    /// returned directly without consulting `rng`.
    pub fn select(
        &self,
        candidates: &[CandidateProvider],
        rng: &mut impl Rng,
    ) -> Option<CandidateProvider> {
        select_weighted(candidates, rng)
    }
}

/// Free function so selection logic is testable without constructing a full
/// pool (registry/descriptor-store/credential-store/health/circuit-breaker
/// wiring).
pub fn select_weighted(candidates: &[CandidateProvider], rng: &mut impl Rng) -> Option<CandidateProvider> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0].clone());
    }

    let total: f64 = candidates.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        let idx = rng.gen_range(0..candidates.len());
        return Some(candidates[idx].clone());
    }

    let pick = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for candidate in candidates {
        cumulative += candidate.weight;
        if pick <= cumulative {
            return Some(candidate.clone());
        }
    }
    candidates.last().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryCredentialStore, InMemoryProviderDescriptorStore, ProviderDescriptor};
    use crate::provider::test_support::MockAdapter;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn candidate(id: &str, weight: f64) -> CandidateProvider {
        CandidateProvider {
            id: id.to_string(),
            display_name: id.to_string(),
            priority: 50,
            health_score: 1.0,
            weight,
        }
    }

    #[test]
    fn empty_candidates_returns_none() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(select_weighted(&[], &mut rng).is_none());
    }

    #[test]
    fn single_candidate_returned_directly() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = vec![candidate("only", 0.0)];
        let picked = select_weighted(&candidates, &mut rng).unwrap();
        assert_eq!(picked.id, "only");
    }

    #[test]
    fn zero_weight_sum_is_uniform() {
        let mut rng = StdRng::seed_from_u64(7);
        let candidates = vec![candidate("a", 0.0), candidate("b", 0.0)];
        let picked = select_weighted(&candidates, &mut rng).unwrap();
        assert!(picked.id == "a" || picked.id == "b");
    }

    #[test]
    fn weighted_distribution_favors_higher_weight() {
        let mut rng = StdRng::seed_from_u64(42);
        let candidates = vec![candidate("high", 0.9), candidate("low", 0.1)];
        let mut high_count = 0;
        for _ in 0..10_000 {
            if select_weighted(&candidates, &mut rng).unwrap().id == "high" {
                high_count += 1;
            }
        }
        let ratio = high_count as f64 / 10_000.0;
        assert!(ratio > 0.85 && ratio < 0.95, "ratio was {ratio}");
    }

    fn descriptor(id: &str, enabled: bool, priority: u8) -> ProviderDescriptor {
        ProviderDescriptor {
            id: id.to_string(),
            display_name: id.to_string(),
            description: String::new(),
            enabled,
            priority,
            has_key: true,
            key_hint: None,
        }
    }

    async fn wired_pool() -> (
        ProviderRegistry,
        InMemoryProviderDescriptorStore,
        InMemoryCredentialStore,
        HealthStore,
        CircuitBreaker,
    ) {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockAdapter::new("A", vec![])));
        registry.register(Arc::new(MockAdapter::new("B", vec![])));
        registry.register(Arc::new(MockAdapter::new("disabled", vec![])));
        registry.register(Arc::new(MockAdapter::new("no-key", vec![])));

        let descriptors = InMemoryProviderDescriptorStore::new();
        descriptors.insert(descriptor("A", true, 50));
        descriptors.insert(descriptor("B", true, 50));
        descriptors.insert(descriptor("disabled", false, 50));
        descriptors.insert(descriptor("no-key", true, 50));

        let credentials = InMemoryCredentialStore::new();
        credentials.save_key("A", "key-a".to_string()).await;
        credentials.save_key("B", "key-b".to_string()).await;
        credentials.save_key("disabled", "key-d".to_string()).await;

        let health = HealthStore::new();
        health.ensure_registered("A");
        health.ensure_registered("B");
        health.ensure_registered("disabled");
        health.ensure_registered("no-key");

        let cb = CircuitBreaker::new(crate::circuit_breaker::CircuitBreakerConfig::default());
        (registry, descriptors, credentials, health, cb)
    }

    #[tokio::test]
    async fn eligibility_excludes_disabled_and_keyless_providers() {
        let (registry, descriptors, credentials, health, cb) = wired_pool().await;
        let pool = CandidatePool::new(&registry, &descriptors, &credentials, &health, &cb, CandidatePoolConfig::default());
        let mut rng = StdRng::seed_from_u64(1);
        let input = SelectionInput {
            exclude_providers: vec![],
            recent_providers: vec![],
        };
        let candidates = pool.get(&input, &mut rng).await;
        let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert!(ids.contains(&"A"));
        assert!(ids.contains(&"B"));
        assert!(!ids.contains(&"disabled"));
        assert!(!ids.contains(&"no-key"));
    }

    #[tokio::test]
    async fn eligibility_excludes_circuit_open_and_excluded_providers() {
        let (registry, descriptors, credentials, health, cb) = wired_pool().await;
        for _ in 0..crate::circuit_breaker::FAILURE_THRESHOLD {
            cb.record_failure("A", &health);
        }
        let pool = CandidatePool::new(&registry, &descriptors, &credentials, &health, &cb, CandidatePoolConfig::default());
        let mut rng = StdRng::seed_from_u64(1);
        let input = SelectionInput {
            exclude_providers: vec!["B".to_string()],
            recent_providers: vec![],
        };
        let candidates = pool.get(&input, &mut rng).await;
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn anti_repeat_multipliers_follow_recency_window() {
        let (registry, descriptors, credentials, health, cb) = wired_pool().await;
        let pool = CandidatePool::new(&registry, &descriptors, &credentials, &health, &cb, CandidatePoolConfig::default());

        let recent = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(pool.anti_repeat_multiplier("C", &recent), 0.2);
        assert_eq!(pool.anti_repeat_multiplier("B", &recent), 0.5);
        assert_eq!(pool.anti_repeat_multiplier("A", &recent), 0.7);
        assert_eq!(pool.anti_repeat_multiplier("X", &recent), 1.0);
    }
}
