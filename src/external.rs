//! External collaborator interfaces.
//!
//! The router core depends on seven narrowly typed external seams instead of
//! reaching into persistence, UI, or memory concerns directly. Each trait
//! below ships one in-memory reference implementation so the core is fully
//! runnable and testable standalone; none of them are meant for production
//! durability (see `DESIGN.md`).

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::RouterError;
use crate::health::CircuitState;
use crate::provider::{Credential, Message, ProviderId};

/// Provider descriptor (configuration), as exposed to the router core.
/// Immutable except for `enabled` and `priority`.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub display_name: String,
    pub description: String,
    pub enabled: bool,
    pub priority: u8,
    pub has_key: bool,
    pub key_hint: Option<String>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_key(&self, provider_id: &str) -> Option<Credential>;
    async fn save_key(&self, provider_id: &str, credential: Credential);
    async fn remove_key(&self, provider_id: &str);
}

pub struct InMemoryCredentialStore {
    keys: DashMap<ProviderId, Credential>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self { keys: DashMap::new() }
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_key(&self, provider_id: &str) -> Option<Credential> {
        self.keys.get(provider_id).map(|v| v.clone())
    }

    async fn save_key(&self, provider_id: &str, credential: Credential) {
        self.keys.insert(provider_id.to_string(), credential);
    }

    async fn remove_key(&self, provider_id: &str) {
        self.keys.remove(provider_id);
    }
}

#[async_trait]
pub trait ProviderDescriptorStore: Send + Sync {
    async fn list(&self) -> Vec<ProviderDescriptor>;
    async fn get(&self, id: &str) -> Option<ProviderDescriptor>;
    async fn update(&self, id: &str, enabled: Option<bool>, priority: Option<u8>);
}

pub struct InMemoryProviderDescriptorStore {
    descriptors: DashMap<ProviderId, ProviderDescriptor>,
}

impl InMemoryProviderDescriptorStore {
    pub fn new() -> Self {
        Self {
            descriptors: DashMap::new(),
        }
    }

    pub fn insert(&self, descriptor: ProviderDescriptor) {
        self.descriptors.insert(descriptor.id.clone(), descriptor);
    }
}

impl Default for InMemoryProviderDescriptorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderDescriptorStore for InMemoryProviderDescriptorStore {
    async fn list(&self) -> Vec<ProviderDescriptor> {
        self.descriptors.iter().map(|e| e.value().clone()).collect()
    }

    async fn get(&self, id: &str) -> Option<ProviderDescriptor> {
        self.descriptors.get(id).map(|e| e.clone())
    }

    async fn update(&self, id: &str, enabled: Option<bool>, priority: Option<u8>) {
        if let Some(mut descriptor) = self.descriptors.get_mut(id) {
            if let Some(enabled) = enabled {
                descriptor.enabled = enabled;
            }
            if let Some(priority) = priority {
                descriptor.priority = priority;
            }
        }
    }
}

/// A snapshot of a provider's persisted health, as exposed across the
/// health persistence seam.
#[derive(Debug, Clone)]
pub struct PersistedHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub latency_ewma_ms: f64,
    pub last_error_kind: Option<String>,
    pub circuit_state: CircuitState,
}

#[async_trait]
pub trait HealthPersistence: Send + Sync {
    async fn get_health(&self, id: &str) -> Option<PersistedHealth>;
    async fn get_all_health(&self) -> HashMap<ProviderId, PersistedHealth>;
    async fn update_health(&self, id: &str, success: bool, latency_ms: u64, error_kind: Option<String>);
    async fn update_circuit_state(&self, id: &str, state: CircuitState, cooldown_until: Option<chrono::DateTime<chrono::Utc>>);
    async fn set_cooldown(&self, id: &str, until: chrono::DateTime<chrono::Utc>);
    async fn clear_cooldown(&self, id: &str);
}

/// Pass-through recorder; the core is correct against this stub alone, per
/// the non-goal that persistent durability of router state is out of scope.
pub struct InMemoryHealthPersistence {
    records: DashMap<ProviderId, PersistedHealth>,
}

impl InMemoryHealthPersistence {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for InMemoryHealthPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthPersistence for InMemoryHealthPersistence {
    async fn get_health(&self, id: &str) -> Option<PersistedHealth> {
        self.records.get(id).map(|r| r.clone())
    }

    async fn get_all_health(&self) -> HashMap<ProviderId, PersistedHealth> {
        self.records.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    async fn update_health(&self, id: &str, success: bool, latency_ms: u64, error_kind: Option<String>) {
        let mut entry = self.records.entry(id.to_string()).or_insert(PersistedHealth {
            success_count: 0,
            failure_count: 0,
            latency_ewma_ms: 0.0,
            last_error_kind: None,
            circuit_state: CircuitState::Closed,
        });
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
            entry.last_error_kind = error_kind;
        }
        entry.latency_ewma_ms = 0.2 * latency_ms as f64 + 0.8 * entry.latency_ewma_ms;
    }

    async fn update_circuit_state(&self, id: &str, state: CircuitState, _cooldown_until: Option<chrono::DateTime<chrono::Utc>>) {
        if let Some(mut entry) = self.records.get_mut(id) {
            entry.circuit_state = state;
        }
    }

    async fn set_cooldown(&self, _id: &str, _until: chrono::DateTime<chrono::Utc>) {}

    async fn clear_cooldown(&self, _id: &str) {}
}

/// One emitted router event, as defined in the data model.
#[derive(Debug, Clone)]
pub struct RouterEvent {
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub kind: RouterEventKind,
    pub provider_id: Option<ProviderId>,
    pub attempt_number: u32,
    pub latency_ms: Option<u64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEventKind {
    Attempt,
    Success,
    Failure,
    Fallback,
    Exhaust,
}

pub trait RouterEventSink: Send + Sync {
    fn log(&self, event: RouterEvent);
}

/// Default sink: structured logging only, no feedback into routing.
pub struct TracingEventSink;

impl RouterEventSink for TracingEventSink {
    fn log(&self, event: RouterEvent) {
        match event.kind {
            RouterEventKind::Attempt => tracing::debug!(
                conversation_id = %event.conversation_id,
                provider_id = ?event.provider_id,
                attempt = event.attempt_number,
                "routing attempt"
            ),
            RouterEventKind::Success => tracing::info!(
                conversation_id = %event.conversation_id,
                provider_id = ?event.provider_id,
                latency_ms = ?event.latency_ms,
                "routing success"
            ),
            RouterEventKind::Failure => tracing::warn!(
                conversation_id = %event.conversation_id,
                provider_id = ?event.provider_id,
                error_kind = ?event.error_kind,
                error_message = ?event.error_message,
                "routing attempt failed"
            ),
            RouterEventKind::Fallback => tracing::info!(
                conversation_id = %event.conversation_id,
                attempt = event.attempt_number,
                "falling back to next candidate"
            ),
            RouterEventKind::Exhaust => tracing::warn!(
                conversation_id = %event.conversation_id,
                attempts = event.attempt_number,
                "exhausted all candidates"
            ),
        }
    }
}

#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build_context(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, RouterError>;

    /// Fire-and-forget background summarization trigger.
    async fn maybe_summarize(&self, conversation_id: &str);
}

/// Returns `messages` unchanged; summarization is a no-op.
pub struct PassthroughContextBuilder;

#[async_trait]
impl ContextBuilder for PassthroughContextBuilder {
    async fn build_context(
        &self,
        _conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, RouterError> {
        Ok(messages)
    }

    async fn maybe_summarize(&self, _conversation_id: &str) {}
}

#[derive(Debug, Clone)]
pub struct MessageMetadataUpdate {
    pub content: String,
    pub provider_id: Option<ProviderId>,
    pub model: Option<String>,
    pub tokens: Option<u32>,
    pub latency_ms: Option<u64>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, conversation_id: &str, role: &str, content: &str) -> String;
    async fn update_metadata(&self, id: &str, update: MessageMetadataUpdate) -> Result<(), RouterError>;
    async fn delete(&self, id: &str);
    async fn list_by_conversation(&self, conversation_id: &str) -> Vec<String>;
}

pub struct InMemoryMessageStore {
    by_conversation: DashMap<String, Vec<String>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            by_conversation: DashMap::new(),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, conversation_id: &str, _role: &str, _content: &str) -> String {
        let id = format!("msg-{}", uuid::Uuid::new_v4());
        self.by_conversation
            .entry(conversation_id.to_string())
            .or_default()
            .push(id.clone());
        id
    }

    async fn update_metadata(&self, _id: &str, _update: MessageMetadataUpdate) -> Result<(), RouterError> {
        Ok(())
    }

    async fn delete(&self, id: &str) {
        for mut entry in self.by_conversation.iter_mut() {
            entry.value_mut().retain(|existing| existing != id);
        }
    }

    async fn list_by_conversation(&self, conversation_id: &str) -> Vec<String> {
        self.by_conversation
            .get(conversation_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}
