//! End-to-end request orchestration.
//!
//! `Router::route` builds the final message list via the context builder,
//! then loops: pick a candidate, drive its adapter stream, record the
//! outcome in health and the circuit breaker, and either return success or
//! fall back to the next candidate with exponential backoff. Everything
//! inside one `route` call runs on a single logical task — no concurrency is
//! introduced inside a single request, matching the sequencing guarantees
//! the whole core depends on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::candidate_pool::{CandidatePool, CandidatePoolConfig, SelectionInput};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::NormalizedError;
use crate::external::{
    ContextBuilder, CredentialStore, HealthPersistence, InMemoryHealthPersistence, MessageMetadataUpdate,
    MessageStore, PassthroughContextBuilder, ProviderDescriptorStore, RouterEvent, RouterEventKind,
    RouterEventSink, TracingEventSink,
};
use crate::health::HealthStore;
use crate::provider::{FinishReason, GenerateRequest, Message, ProviderId, StreamChunk, Usage};
use crate::registry::ProviderRegistry;

pub const MAX_ATTEMPTS: u32 = 6;
pub const BASE_RETRY_MS: u64 = 1_000;
pub const MAX_RETRY_MS: u64 = 30_000;
/// Bound on the per-conversation recent-providers FIFO used by anti-repeat.
const RECENT_PROVIDERS_CAPACITY: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub max_attempts: u32,
    pub base_retry_ms: u64,
    pub max_retry_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_retry_ms: BASE_RETRY_MS,
            max_retry_ms: MAX_RETRY_MS,
        }
    }
}

pub struct RouteOptions<'a> {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub user_message_id: Option<String>,
    pub cancel: CancellationToken,
    pub on_stream: &'a mut dyn FnMut(&StreamChunk),
}

#[derive(Debug, Clone, Default)]
pub struct RouteResult {
    pub success: bool,
    pub content: Option<String>,
    pub provider_id: Option<ProviderId>,
    pub model: Option<String>,
    pub tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub error: Option<NormalizedError>,
    pub cancelled: bool,
    pub attempts_used: u32,
    pub message_id: Option<String>,
}

impl RouteResult {
    fn cancelled_after(attempts_used: u32) -> Self {
        Self {
            cancelled: true,
            attempts_used,
            ..Default::default()
        }
    }
}

pub struct Router {
    registry: ProviderRegistry,
    health: HealthStore,
    circuit_breaker: CircuitBreaker,
    credentials: Arc<dyn CredentialStore>,
    descriptors: Arc<dyn ProviderDescriptorStore>,
    event_sink: Arc<dyn RouterEventSink>,
    context_builder: Arc<dyn ContextBuilder>,
    message_store: Arc<dyn MessageStore>,
    health_persistence: Arc<dyn HealthPersistence>,
    candidate_pool_config: CandidatePoolConfig,
    config: RouterConfig,
    recent_providers: DashMap<String, VecDeque<ProviderId>>,
}

impl Router {
    pub async fn route(&self, opts: RouteOptions<'_>) -> RouteResult {
        self.route_with_rng(opts, &mut rand::thread_rng()).await
    }

    /// Same as [`Router::route`] but takes an explicit RNG, so tests can pin
    /// the random component of candidate weighting.
    pub async fn route_with_rng(&self, opts: RouteOptions<'_>, rng: &mut impl Rng) -> RouteResult {
        let RouteOptions {
            conversation_id,
            messages,
            user_message_id,
            cancel,
            on_stream,
        } = opts;

        let messages = self
            .context_builder
            .build_context(&conversation_id, messages.clone())
            .await
            .unwrap_or(messages);

        let context_builder = self.context_builder.clone();
        let summarize_conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            context_builder.maybe_summarize(&summarize_conversation_id).await;
        });

        let mut tried: Vec<ProviderId> = Vec::new();
        let mut recent = self.recent_providers_for(&conversation_id);
        let mut last_error: Option<NormalizedError> = None;
        let mut attempt: u32 = 0;

        while attempt < self.config.max_attempts {
            attempt += 1;

            if cancel.is_cancelled() {
                return RouteResult::cancelled_after(attempt - 1);
            }

            let pool = CandidatePool::new(
                &self.registry,
                self.descriptors.as_ref(),
                self.credentials.as_ref(),
                &self.health,
                &self.circuit_breaker,
                self.candidate_pool_config.clone(),
            );
            let input = SelectionInput {
                exclude_providers: tried.clone(),
                recent_providers: recent.iter().cloned().collect(),
            };
            let candidates = pool.get(&input, rng).await;

            if candidates.is_empty() {
                self.event_sink.log(RouterEvent {
                    conversation_id: conversation_id.clone(),
                    message_id: user_message_id.clone(),
                    kind: RouterEventKind::Exhaust,
                    provider_id: None,
                    attempt_number: attempt,
                    latency_ms: None,
                    error_kind: last_error.as_ref().map(|e| e.kind().to_string()),
                    error_message: last_error.as_ref().map(|e| e.message().to_string()),
                });
                return RouteResult {
                    success: false,
                    error: last_error,
                    attempts_used: attempt - 1,
                    ..Default::default()
                };
            }

            let Some(candidate) = pool.select(&candidates, rng) else {
                continue;
            };
            tried.push(candidate.id.clone());

            self.event_sink.log(RouterEvent {
                conversation_id: conversation_id.clone(),
                message_id: user_message_id.clone(),
                kind: RouterEventKind::Attempt,
                provider_id: Some(candidate.id.clone()),
                attempt_number: attempt,
                latency_ms: None,
                error_kind: None,
                error_message: None,
            });

            let Some(adapter) = self.registry.get(&candidate.id) else {
                continue;
            };
            let Some(credential) = self.credentials.get_key(&candidate.id).await else {
                continue;
            };

            let request = GenerateRequest {
                messages: messages.clone(),
                ..Default::default()
            };

            let t0 = Instant::now();
            let mut stream = adapter.generate(request, credential, cancel.clone()).await;

            let mut content = String::new();
            let mut terminal: Option<StreamChunk> = None;
            let mut was_cancelled = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        was_cancelled = true;
                        break;
                    }
                    chunk = stream.next() => {
                        match chunk {
                            Some(StreamChunk::Delta { delta }) => {
                                content.push_str(&delta);
                                on_stream(&StreamChunk::Delta { delta });
                            }
                            Some(done @ StreamChunk::Done { .. }) => {
                                on_stream(&done);
                                terminal = Some(done);
                                break;
                            }
                            Some(err @ StreamChunk::Error { .. }) => {
                                terminal = Some(err);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            if was_cancelled {
                return RouteResult::cancelled_after(attempt);
            }

            let latency = t0.elapsed();

            match terminal {
                Some(StreamChunk::Done {
                    usage,
                    model,
                    finish_reason: _,
                }) => {
                    self.health.record_success(&candidate.id, latency);
                    self.circuit_breaker.record_success(&candidate.id, &self.health);
                    self.health_persistence
                        .update_health(&candidate.id, true, latency.as_millis() as u64, None)
                        .await;
                    push_recent(&mut recent, candidate.id.clone());
                    self.recent_providers
                        .insert(conversation_id.clone(), recent.clone());

                    self.event_sink.log(RouterEvent {
                        conversation_id: conversation_id.clone(),
                        message_id: user_message_id.clone(),
                        kind: RouterEventKind::Success,
                        provider_id: Some(candidate.id.clone()),
                        attempt_number: attempt,
                        latency_ms: Some(latency.as_millis() as u64),
                        error_kind: None,
                        error_message: None,
                    });

                    return RouteResult {
                        success: true,
                        content: Some(content),
                        provider_id: Some(candidate.id),
                        model: Some(model),
                        tokens: Some(usage.total_tokens),
                        latency_ms: Some(latency.as_millis() as u64),
                        error: None,
                        cancelled: false,
                        attempts_used: attempt,
                        message_id: None,
                    };
                }
                Some(StreamChunk::Error { error }) => {
                    last_error = Some(error.clone());
                    self.health
                        .record_failure(&candidate.id, latency, error.kind());
                    self.circuit_breaker.record_failure(&candidate.id, &self.health);
                    self.health_persistence
                        .update_health(
                            &candidate.id,
                            false,
                            latency.as_millis() as u64,
                            Some(error.kind().to_string()),
                        )
                        .await;

                    if let NormalizedError::RateLimit { retry_after_ms, .. } = &error {
                        let retry_after = retry_after_ms.map(Duration::from_millis);
                        self.circuit_breaker
                            .apply_rate_limit_cooldown(&candidate.id, retry_after, &self.health);
                    }

                    self.event_sink.log(RouterEvent {
                        conversation_id: conversation_id.clone(),
                        message_id: user_message_id.clone(),
                        kind: RouterEventKind::Failure,
                        provider_id: Some(candidate.id.clone()),
                        attempt_number: attempt,
                        latency_ms: Some(latency.as_millis() as u64),
                        error_kind: Some(error.kind().to_string()),
                        error_message: Some(error.message().to_string()),
                    });
                    self.event_sink.log(RouterEvent {
                        conversation_id: conversation_id.clone(),
                        message_id: user_message_id.clone(),
                        kind: RouterEventKind::Fallback,
                        provider_id: Some(candidate.id.clone()),
                        attempt_number: attempt,
                        latency_ms: None,
                        error_kind: None,
                        error_message: None,
                    });
                }
                Some(StreamChunk::Delta { .. }) => {
                    unreachable!("terminal is only ever assigned Done or Error chunks")
                }
                None => {
                    // Stream ended without a terminator: synthesize `done`
                    // with empty usage and treat it as a success.
                    self.health.record_success(&candidate.id, latency);
                    self.circuit_breaker.record_success(&candidate.id, &self.health);
                    self.health_persistence
                        .update_health(&candidate.id, true, latency.as_millis() as u64, None)
                        .await;
                    push_recent(&mut recent, candidate.id.clone());
                    self.recent_providers
                        .insert(conversation_id.clone(), recent.clone());

                    let synthesized = StreamChunk::Done {
                        usage: Usage::default(),
                        model: String::new(),
                        finish_reason: FinishReason::Stop,
                    };
                    on_stream(&synthesized);

                    return RouteResult {
                        success: true,
                        content: Some(content),
                        provider_id: Some(candidate.id),
                        model: None,
                        tokens: Some(0),
                        latency_ms: Some(latency.as_millis() as u64),
                        attempts_used: attempt,
                        ..Default::default()
                    };
                }
            }

            let backoff_ms = self
                .config
                .base_retry_ms
                .saturating_mul(1u64 << attempt.saturating_sub(1).min(63))
                .min(self.config.max_retry_ms);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RouteResult::cancelled_after(attempt);
                }
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
        }

        RouteResult {
            success: false,
            error: last_error,
            attempts_used: self.config.max_attempts,
            ..Default::default()
        }
    }

    /// Wraps `route`: creates a placeholder assistant message up front,
    /// streams chunks to `sink`, and finalizes the message (metadata update
    /// on success, delete on failure) once routing completes.
    pub async fn route_and_save<F: FnMut(&StreamChunk) + Send>(
        &self,
        conversation_id: String,
        messages: Vec<Message>,
        cancel: CancellationToken,
        mut sink: F,
    ) -> RouteResult {
        let message_id = self.message_store.create(&conversation_id, "assistant", "").await;

        let mut on_stream = |chunk: &StreamChunk| sink(chunk);
        let opts = RouteOptions {
            conversation_id,
            messages,
            user_message_id: None,
            cancel,
            on_stream: &mut on_stream,
        };
        let mut result = self.route(opts).await;
        result.message_id = Some(message_id.clone());

        if result.success {
            let _ = self
                .message_store
                .update_metadata(
                    &message_id,
                    MessageMetadataUpdate {
                        content: result.content.clone().unwrap_or_default(),
                        provider_id: result.provider_id.clone(),
                        model: result.model.clone(),
                        tokens: result.tokens,
                        latency_ms: result.latency_ms,
                    },
                )
                .await;
        } else {
            self.message_store.delete(&message_id).await;
        }

        result
    }

    fn recent_providers_for(&self, conversation_id: &str) -> VecDeque<ProviderId> {
        self.recent_providers
            .get(conversation_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Clears the in-process recent-providers memory for one conversation.
    pub fn clear_recent_providers(&self, conversation_id: &str) {
        self.recent_providers.remove(conversation_id);
    }

    pub fn health(&self) -> &HealthStore {
        &self.health
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }
}

fn push_recent(recent: &mut VecDeque<ProviderId>, id: ProviderId) {
    recent.retain(|existing| existing != &id);
    recent.push_back(id);
    while recent.len() > RECENT_PROVIDERS_CAPACITY {
        recent.pop_front();
    }
}

/// Assembles one [`Router`] from its collaborators. Anything not set
/// explicitly falls back to the in-memory reference stub for that seam, so
/// `RouterBuilder::new(registry).build()` alone is already runnable.
pub struct RouterBuilder {
    registry: ProviderRegistry,
    credentials: Option<Arc<dyn CredentialStore>>,
    descriptors: Option<Arc<dyn ProviderDescriptorStore>>,
    event_sink: Option<Arc<dyn RouterEventSink>>,
    context_builder: Option<Arc<dyn ContextBuilder>>,
    message_store: Option<Arc<dyn MessageStore>>,
    health_persistence: Option<Arc<dyn HealthPersistence>>,
    circuit_breaker_config: CircuitBreakerConfig,
    candidate_pool_config: CandidatePoolConfig,
    router_config: RouterConfig,
}

impl RouterBuilder {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            credentials: None,
            descriptors: None,
            event_sink: None,
            context_builder: None,
            message_store: None,
            health_persistence: None,
            circuit_breaker_config: CircuitBreakerConfig::default(),
            candidate_pool_config: CandidatePoolConfig::default(),
            router_config: RouterConfig::default(),
        }
    }

    pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn with_descriptors(mut self, store: Arc<dyn ProviderDescriptorStore>) -> Self {
        self.descriptors = Some(store);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn RouterEventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_context_builder(mut self, builder: Arc<dyn ContextBuilder>) -> Self {
        self.context_builder = Some(builder);
        self
    }

    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    pub fn with_health_persistence(mut self, store: Arc<dyn HealthPersistence>) -> Self {
        self.health_persistence = Some(store);
        self
    }

    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_config = config;
        self
    }

    pub fn with_candidate_pool_config(mut self, config: CandidatePoolConfig) -> Self {
        self.candidate_pool_config = config;
        self
    }

    pub fn with_router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = config;
        self
    }

    pub fn build(self) -> Router {
        let health = HealthStore::new();
        for id in self.registry.list_ids() {
            health.ensure_registered(&id);
        }

        Router {
            registry: self.registry,
            health,
            circuit_breaker: CircuitBreaker::new(self.circuit_breaker_config),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(crate::external::InMemoryCredentialStore::new())),
            descriptors: self
                .descriptors
                .unwrap_or_else(|| Arc::new(crate::external::InMemoryProviderDescriptorStore::new())),
            event_sink: self.event_sink.unwrap_or_else(|| Arc::new(TracingEventSink)),
            context_builder: self
                .context_builder
                .unwrap_or_else(|| Arc::new(PassthroughContextBuilder)),
            message_store: self
                .message_store
                .unwrap_or_else(|| Arc::new(crate::external::InMemoryMessageStore::new())),
            health_persistence: self
                .health_persistence
                .unwrap_or_else(|| Arc::new(InMemoryHealthPersistence::new())),
            candidate_pool_config: self.candidate_pool_config,
            config: self.router_config,
            recent_providers: DashMap::new(),
        }
    }
}
