//! Error types for agent-relay.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

/// Primary error type for all relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection lost or reset underneath a backend.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or empty model response.
    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    #[error("Confirmation {call_id} expired after {timeout_ms}ms")]
    ConfirmationTimeout { call_id: String, timeout_ms: u64 },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    /// Backend failed to start (missing credentials, port conflict, spawn failure).
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation canceled")]
    Canceled,
}

impl RelayError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) | Self::Transport(_) => ErrorCategory::Transport,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Serialization(_) | Self::Protocol(_) => ErrorCategory::Protocol,
            Self::InvalidStream(_) => ErrorCategory::InvalidStream,
            Self::ConfirmationTimeout { .. } => ErrorCategory::ConfirmationTimeout,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::Bootstrap(_) => ErrorCategory::Bootstrap,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit
                | ErrorCategory::Transport
                | ErrorCategory::Timeout
                | ErrorCategory::Server
                | ErrorCategory::InvalidStream
        )
    }

    /// Whether a key rotation may fix this error.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Authentication | ErrorCategory::RateLimit
        )
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Authentication => RecoverySuggestion::CheckCredentials,
            ErrorCategory::RateLimit
            | ErrorCategory::Transport
            | ErrorCategory::Server
            | ErrorCategory::InvalidStream => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Configuration | ErrorCategory::Bootstrap => {
                RecoverySuggestion::CheckConfiguration
            }
            ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
            ErrorCategory::ConfirmationTimeout => RecoverySuggestion::ResendMessage,
            _ => RecoverySuggestion::ContactSupport,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_invalid_stream_are_retryable() {
        assert!(RelayError::Transport("reset".into()).is_retryable());
        assert!(RelayError::InvalidStream("empty".into()).is_retryable());
        assert!(!RelayError::Bootstrap("no key".into()).is_retryable());
    }

    #[test]
    fn api_status_maps_to_category() {
        assert_eq!(
            RelayError::api(401, "nope").category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            RelayError::api(503, "busy").category(),
            ErrorCategory::Server
        );
        assert!(RelayError::api(429, "slow down").is_credential_failure());
    }

    #[test]
    fn confirmation_timeout_suggests_resend() {
        let err = RelayError::ConfirmationTimeout {
            call_id: "c1".into(),
            timeout_ms: 70_000,
        };
        assert_eq!(err.recovery_suggestion(), RecoverySuggestion::ResendMessage);
        assert!(err.to_string().contains("c1"));
    }
}
