//! Provider adapter contract.
//!
//! Every upstream LLM integration implements [`Adapter`]. The router only
//! ever talks to this trait — it has no knowledge of any particular
//! provider's wire protocol. An adapter is a thin translation layer: it turns
//! a [`GenerateRequest`] into whatever HTTP/gRPC/local call its upstream
//! wants, and turns the upstream's response stream into [`StreamChunk`]s.
//!
//! The contract an adapter must uphold is documented on [`Adapter::generate`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::NormalizedError;

/// Stable identifier for a registered provider, e.g. `"openai"`, `"groq"`.
pub type ProviderId = String;

/// A single turn in the conversation sent to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Message::user(String::new())
    }
}

/// The request an adapter turns into an upstream call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop_sequences: Option<Vec<String>>,
}

/// Token accounting returned alongside a completed generation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// One element of the lazy sequence an adapter's `generate` produces.
///
/// Exactly one terminator (`Done` or `Error`) follows zero or more `Delta`s;
/// nothing is produced after the terminator. See [`Adapter::generate`].
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Delta {
        delta: String,
    },
    Done {
        usage: Usage,
        model: String,
        finish_reason: FinishReason,
    },
    Error {
        error: NormalizedError,
    },
}

/// What the router has to show for a finished attempt, once the terminal
/// `Done` chunk has been observed.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// Opaque credential handed to an adapter. For most providers this is an API
/// key; some providers encode extra fields in the string (an account id, or
/// a local runtime's base URL). Interpreting the contents is the adapter's
/// job — the core treats it as opaque.
pub type Credential = String;

/// Cooperative cancellation handle. Adapters must observe it at I/O
/// boundaries and stop producing chunks once it fires; no terminator is
/// required on cancellation.
pub type CancelToken = tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Capabilities {
    pub streams: bool,
    pub system_messages: bool,
    pub function_calling: bool,
    pub vision: bool,
    pub max_context_tokens: u32,
    pub default_model: String,
    pub available_models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectionTestResult {
    pub ok: bool,
    pub error: Option<NormalizedError>,
    pub latency_ms: u64,
}

/// A lazily-produced sequence of [`StreamChunk`]s.
pub type ChunkStream = BoxStream<'static, StreamChunk>;

/// The uniform interface every upstream LLM integration implements.
///
/// Contract adapters must uphold:
/// 1. The chunk sequence is zero or more `Delta`s followed by exactly one
///    terminator (`Done` or `Error`); nothing follows the terminator.
/// 2. `Done` implies the accumulated deltas are the final content; `Error`
///    implies the content may be partial and must never be surfaced as a
///    completed response.
/// 3. If `cancel` fires, the adapter stops producing chunks and releases
///    upstream resources; it need not emit a terminator.
/// 4. Any exception, sync or async, is equivalent to emitting an `Error`
///    chunk carrying `self.normalize_error(..)` of the raised value.
/// 5. Adapters may retry opaque transport-level blips themselves (one TCP
///    reset); all higher-level retry/fallback belongs to the router.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable identifier, constant for the lifetime of the adapter.
    fn id(&self) -> &ProviderId;

    fn capabilities(&self) -> &Capabilities;

    /// Start a generation. Returns a stream of chunks per the contract
    /// documented on this trait.
    async fn generate(
        &self,
        request: GenerateRequest,
        credential: Credential,
        cancel: CancelToken,
    ) -> ChunkStream;

    /// Exercise the credential against the upstream without a full
    /// generation, for "is this key valid" checks.
    async fn test_connection(&self, credential: Credential) -> ConnectionTestResult;

    /// Turn a raw provider error (and status code, if one is available)
    /// into the closed taxonomy. Adapters that can't say anything more
    /// specific fall back to [`crate::error::classify`].
    fn normalize_error(&self, raw: &str, status_code: Option<u16>) -> NormalizedError {
        crate::error::classify(raw, status_code)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A scripted adapter outcome, used to drive [`MockAdapter`] through
    /// deterministic attempt sequences in router/candidate-pool tests.
    #[derive(Clone)]
    pub enum ScriptedOutcome {
        Success {
            deltas: Vec<&'static str>,
            model: &'static str,
            total_tokens: u32,
        },
        Failure(NormalizedError),
        /// Emits the given deltas, each after a short delay, then hangs
        /// forever without a terminator — used to exercise mid-stream
        /// cancellation, where the delay gives `cancel` a window to fire
        /// between deltas.
        HangAfter(Vec<&'static str>),
        /// Emits the given deltas with no delay and ends the stream without
        /// a terminator — used to exercise the no-terminator edge case.
        EndsWithoutTerminator(Vec<&'static str>),
    }

    enum HangState {
        Emitting(Vec<&'static str>, usize),
    }

    async fn hang_step(state: HangState) -> Option<(StreamChunk, HangState)> {
        let HangState::Emitting(deltas, idx) = state;
        if idx < deltas.len() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let chunk = StreamChunk::Delta {
                delta: deltas[idx].to_string(),
            };
            Some((chunk, HangState::Emitting(deltas, idx + 1)))
        } else {
            futures::future::pending::<()>().await;
            unreachable!("hang_step never resolves once every delta is emitted")
        }
    }

    pub struct MockAdapter {
        id: ProviderId,
        capabilities: Capabilities,
        script: Vec<ScriptedOutcome>,
        calls: AtomicUsize,
    }

    impl MockAdapter {
        pub fn new(id: impl Into<String>, script: Vec<ScriptedOutcome>) -> Self {
            Self {
                id: id.into(),
                capabilities: Capabilities {
                    streams: true,
                    system_messages: true,
                    function_calling: false,
                    vision: false,
                    max_context_tokens: 8192,
                    default_model: "mock-model".to_string(),
                    available_models: vec!["mock-model".to_string()],
                },
                script,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        fn id(&self) -> &ProviderId {
            &self.id
        }

        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }

        async fn generate(
            &self,
            _request: GenerateRequest,
            _credential: Credential,
            _cancel: CancelToken,
        ) -> ChunkStream {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.get(idx).cloned().unwrap_or_else(|| {
                ScriptedOutcome::Failure(NormalizedError::Unknown {
                    message: "mock script exhausted".to_string(),
                })
            });

            let chunks: Vec<StreamChunk> = match outcome {
                ScriptedOutcome::Success {
                    deltas,
                    model,
                    total_tokens,
                } => {
                    let mut v: Vec<StreamChunk> = deltas
                        .into_iter()
                        .map(|d| StreamChunk::Delta {
                            delta: d.to_string(),
                        })
                        .collect();
                    v.push(StreamChunk::Done {
                        usage: Usage {
                            prompt_tokens: 0,
                            completion_tokens: total_tokens,
                            total_tokens,
                        },
                        model: model.to_string(),
                        finish_reason: FinishReason::Stop,
                    });
                    v
                }
                ScriptedOutcome::Failure(err) => vec![StreamChunk::Error { error: err }],
                ScriptedOutcome::HangAfter(deltas) => {
                    return Box::pin(stream::unfold(HangState::Emitting(deltas, 0), hang_step));
                }
                ScriptedOutcome::EndsWithoutTerminator(deltas) => deltas
                    .into_iter()
                    .map(|d| StreamChunk::Delta {
                        delta: d.to_string(),
                    })
                    .collect(),
            };

            Box::pin(stream::iter(chunks))
        }

        async fn test_connection(&self, _credential: Credential) -> ConnectionTestResult {
            ConnectionTestResult {
                ok: true,
                error: None,
                latency_ms: 1,
            }
        }
    }

    pub fn arc_mock(id: &str, script: Vec<ScriptedOutcome>) -> Arc<dyn Adapter> {
        Arc::new(MockAdapter::new(id, script))
    }
}
