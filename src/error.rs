//! Normalized error taxonomy.
//!
//! Every provider adapter maps its own failure modes into [`NormalizedError`]
//! before handing them back to the router. Routing decisions — whether to
//! retry, which candidate to exclude, whether to apply a cooldown — key off
//! this classification and nothing else. The variant set is closed: adding a
//! case here means updating routing policy everywhere that matches on it.
//!
//! [`classify_message`] implements the string-heuristic fallback adapters use
//! when an upstream doesn't hand back a structured error. The precedence
//! order it checks in is load-bearing: rate-limit messages frequently contain
//! the word "key", so rate limit must be tested before auth or a throttled
//! request reads as a credential failure.

use thiserror::Error;

/// The closed set of routing-relevant error classifications.
///
/// Adapters exchange only this type once an error leaves
/// `normalize_error`; nothing downstream inspects a raw provider error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizedError {
    /// Upstream throttled the request. `retry_after_ms` drives the
    /// circuit breaker's rate-limit cooldown when present.
    #[error("rate limited: {message}")]
    RateLimit {
        retry_after_ms: Option<u64>,
        message: String,
    },

    /// Credentials invalid, expired, or missing permission.
    #[error("auth error: {message}")]
    Auth { message: String },

    /// Payment or subscription prevents use even though credentials
    /// are otherwise valid.
    #[error("billing error: {message}")]
    Billing { message: String },

    /// Request exceeds the model's context window.
    #[error("context length exceeded (max {max_tokens} tokens): {message}")]
    ContextLength { max_tokens: u32, message: String },

    /// Upstream safety layer refused the request.
    #[error("content filtered: {message}")]
    ContentFilter { message: String },

    /// 5xx or equivalent.
    #[error("server error: {message}")]
    ServerError {
        status_code: Option<u16>,
        message: String,
    },

    /// Connection refused, DNS, TLS, socket-level failure.
    #[error("network error: {message}")]
    Network { message: String },

    /// Anything that doesn't fit the above.
    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl NormalizedError {
    /// Short tag used in health records (`last_error_kind`) and router events.
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedError::RateLimit { .. } => "rate_limit",
            NormalizedError::Auth { .. } => "auth",
            NormalizedError::Billing { .. } => "billing",
            NormalizedError::ContextLength { .. } => "context_length",
            NormalizedError::ContentFilter { .. } => "content_filter",
            NormalizedError::ServerError { .. } => "server_error",
            NormalizedError::Network { .. } => "network",
            NormalizedError::Unknown { .. } => "unknown",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            NormalizedError::RateLimit { message, .. } => message,
            NormalizedError::Auth { message } => message,
            NormalizedError::Billing { message } => message,
            NormalizedError::ContextLength { message, .. } => message,
            NormalizedError::ContentFilter { message } => message,
            NormalizedError::ServerError { message, .. } => message,
            NormalizedError::Network { message } => message,
            NormalizedError::Unknown { message } => message,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            NormalizedError::RateLimit { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Classify a raw error by status code first, falling back to the message
/// heuristic. A status code dominates string heuristics entirely.
pub fn classify(message: &str, status_code: Option<u16>) -> NormalizedError {
    if let Some(code) = status_code {
        if let Some(err) = classify_status(code, message) {
            return err;
        }
    }
    classify_message(message)
}

fn classify_status(code: u16, message: &str) -> Option<NormalizedError> {
    match code {
        401 | 403 => Some(NormalizedError::Auth {
            message: message.to_string(),
        }),
        402 => Some(NormalizedError::Billing {
            message: message.to_string(),
        }),
        429 => Some(NormalizedError::RateLimit {
            retry_after_ms: None,
            message: message.to_string(),
        }),
        c if c >= 500 => Some(NormalizedError::ServerError {
            status_code: Some(c),
            message: message.to_string(),
        }),
        _ => None,
    }
}

/// String-heuristic classifier. Order matters: network, then rate_limit,
/// then auth, then context_length, then content_filter, then unknown.
pub fn classify_message(message: &str) -> NormalizedError {
    let lower = message.to_lowercase();

    if contains_any(
        &lower,
        &[
            "connection refused",
            "dns",
            "tls",
            "socket",
            "connection reset",
            "network",
        ],
    ) {
        return NormalizedError::Network {
            message: message.to_string(),
        };
    }

    if contains_any(
        &lower,
        &[
            "quota",
            "resource_exhausted",
            "429",
            "rate limit",
            "rate_limit",
            "too many requests",
        ],
    ) {
        return NormalizedError::RateLimit {
            retry_after_ms: None,
            message: message.to_string(),
        };
    }

    if contains_any(
        &lower,
        &[
            "api key",
            "api_key",
            "unauthorized",
            "invalid credentials",
            "authentication",
            "permission",
            "forbidden",
        ],
    ) {
        return NormalizedError::Auth {
            message: message.to_string(),
        };
    }

    if contains_any(
        &lower,
        &["context length", "context_length", "maximum context", "too many tokens"],
    ) {
        return NormalizedError::ContextLength {
            max_tokens: 0,
            message: message.to_string(),
        };
    }

    if contains_any(
        &lower,
        &["content filter", "content_filter", "safety", "blocked by policy"],
    ) {
        return NormalizedError::ContentFilter {
            message: message.to_string(),
        };
    }

    NormalizedError::Unknown {
        message: message.to_string(),
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Operational failures that are not themselves routing outcomes: a
/// misconfigured lookup, a poisoned lock, an external collaborator
/// surfacing its own error. Never appears inside a `RouteResult`.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("provider not registered: {0}")]
    UnknownProvider(String),

    #[error("context builder failed: {0}")]
    ContextBuilder(String),

    #[error("message store failed: {0}")]
    MessageStore(String),
}
