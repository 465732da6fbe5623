//! Error types for the meeting orchestrator

use crate::models::ChatResponse;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Meeting Pipeline Errors
    // =============================

    #[error("config error: {0}")]
    Config(String),

    #[error("no AI provider configured")]
    NoProviderConfig,

    #[error("no experts available")]
    NoAgents,

    #[error("moderator decision parse error: {0}")]
    Parse(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("model returned no usable content: {0}")]
    ModelContent(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("memory error: {0}")]
    Memory(String),

    /// A single turn's deadline expired. Retryable at the turn level.
    #[error("deadline exceeded")]
    Timeout,

    /// The whole meeting's deadline expired. Carries every response
    /// collected before the cutoff.
    #[error("meeting deadline exceeded, partial results returned")]
    MeetingTimeout(Vec<ChatResponse>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no resumable meeting state")]
    NoResumableState,

    // =============================
    // External Library Conversions
    // =============================

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Whether a failed turn may be attempted again.
    ///
    /// Cancellation and expired deadlines are final, configuration problems
    /// will not fix themselves, and anything mentioning "config" or
    /// "not found" is treated as configuration no matter where it came from.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::Cancelled
            | OrchestrationError::Timeout
            | OrchestrationError::MeetingTimeout(_)
            | OrchestrationError::Config(_)
            | OrchestrationError::NoProviderConfig
            | OrchestrationError::NoAgents
            | OrchestrationError::Parse(_)
            | OrchestrationError::NoResumableState => false,
            other => {
                let msg = other.to_string();
                !msg.contains("config") && !msg.contains("not found")
            }
        }
    }
}
