//! Top-level error type for the dispatch pipeline
//!
//! Each layer owns its own `thiserror` enum; [`WorkerError`] folds them
//! together so the dispatcher can turn any failure into the outbound error
//! message shape. Details are sanitised before they leave the process.

use crate::protocol::messages::{OutboundResponse, RequestError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_ERROR_DETAIL_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("sensitive path pattern is valid")
});

static BEARER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bearer\s+[a-zA-Z0-9._~+/=-]+").expect("bearer pattern is valid")
});

/// Main error type for worker operations
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Request(#[from] RequestError),

    #[error("Resolution failed: {0}")]
    Resolve(#[from] crate::resolution::ResolveError),

    #[error("Idempotency store error: {0}")]
    Idempotency(#[from] crate::idempotency::IdempotencyError),

    #[error("Executor error: {0}")]
    Executor(#[from] crate::executor::ExecutorError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Publish error: {0}")]
    Publish(#[from] crate::publisher::PublishError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WorkerError {
    /// Convert into the outbound error message for `request_id`
    pub fn to_error_response(&self, request_id: &str, chat_summary: &str) -> OutboundResponse {
        OutboundResponse::error(
            request_id,
            chat_summary,
            Some(sanitize_error_message(&self.to_string())),
        )
    }

    /// Short, stable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Request(RequestError::Malformed(_)) => "malformed",
            WorkerError::Request(RequestError::Invalid { .. }) | WorkerError::Resolve(_) => {
                "validation"
            }
            WorkerError::Idempotency(_) => "idempotency",
            WorkerError::Executor(_) | WorkerError::Storage(_) => "executor",
            WorkerError::Publish(_) => "publish",
            WorkerError::Config(_) => "config",
            WorkerError::Transport(_) => "transport",
            WorkerError::Internal { .. } => "internal",
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Redact secrets and sensitive paths, then bound the length.
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = BEARER_PATTERN.replace_all(message, "Bearer ***");
    let sanitized = SECRET_PATTERN.replace_all(&sanitized, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_DETAIL_LEN {
        let max_content_len = MAX_ERROR_DETAIL_LEN - TRUNCATE_SUFFIX.len();
        let cut = sanitized
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|idx| *idx <= max_content_len)
            .last()
            .unwrap_or(0);
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

pub type WorkerResult<T> = Result<T, WorkerError>;
