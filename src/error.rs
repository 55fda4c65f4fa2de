//! Shared error taxonomy.
//!
//! Every component error carries an [`ErrorCategory`] so the fallback
//! orchestrator and quality monitor can react to failure class without
//! matching on component-specific variants, mirroring the retry/backoff
//! decisions made from exception type in
//! `examples/original_source/backend/error_recovery.py`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Upstream engine unreachable or connection dropped.
    Transport,
    /// Upstream engine responded too slowly.
    Timeout,
    /// Upstream engine rejected the request (quota, auth, bad args).
    EngineRejected,
    /// Circuit breaker is open; call was short-circuited.
    BreakerOpen,
    /// Malformed input from a speaker/listener socket.
    Protocol,
    /// Internal invariant violation (buffer overflow, missing config, etc).
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine transport error: {0}")]
    Transport(String),
    #[error("engine call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Transport(_) => ErrorCategory::Transport,
            EngineError::Timeout(_) => ErrorCategory::Timeout,
            EngineError::Rejected(_) => ErrorCategory::EngineRejected,
        }
    }
}

/// Whether a failure is worth retrying. Mirrors §4.2's rule: transient
/// transport/timeout failures retry, but auth/quota/validation rejections
/// never do.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for EngineError {
    fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transport | ErrorCategory::Timeout)
    }
}

impl Retryable for &str {
    fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error + 'static> {
    #[error("circuit breaker open")]
    Open,
    #[error(transparent)]
    Inner(#[from] E),
}

impl<E: std::error::Error + 'static> BreakerError<E> {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BreakerError::Open => ErrorCategory::BreakerOpen,
            BreakerError::Inner(_) => ErrorCategory::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("translation failed: {0}")]
    Translation(#[source] EngineError),
    #[error("synthesis failed: {0}")]
    Synthesis(#[source] EngineError),
    #[error("pipeline call timed out")]
    Timeout,
    #[error("circuit breaker open, using fallback audio")]
    BreakerOpen,
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Translation(e) | PipelineError::Synthesis(e) => e.category(),
            PipelineError::Timeout => ErrorCategory::Timeout,
            PipelineError::BreakerOpen => ErrorCategory::BreakerOpen,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecognizerError {
    #[error("recognizer transport error: {0}")]
    Transport(#[source] EngineError),
    #[error("recognizer session queue is full")]
    QueueFull,
    #[error("recognizer session closed")]
    Closed,
}

impl RecognizerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RecognizerError::Transport(e) => e.category(),
            RecognizerError::QueueFull => ErrorCategory::Internal,
            RecognizerError::Closed => ErrorCategory::Transport,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed client frame: {0}")]
    Protocol(String),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Protocol(_) => ErrorCategory::Protocol,
            SessionError::Recognizer(e) => e.category(),
            SessionError::Pipeline(e) => e.category(),
        }
    }
}
