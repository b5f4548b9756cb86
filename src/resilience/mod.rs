//! Stream liveness, failure classification and bounded retry.

pub mod monitor;
pub mod retry;
pub mod timeout;

pub use monitor::StreamMonitor;
pub use retry::{InvalidStreamRetry, RetryDecision, RetryPolicy};
pub use timeout::with_timeout;

use crate::backend::StreamSignal;
use crate::error::RelayError;

const TRANSPORT_PATTERNS: &[&str] = &[
    "connection reset",
    "econnreset",
    "connection refused",
    "broken pipe",
    "timeout",
    "timed out",
    "etimedout",
    "network",
    "socket hang up",
];

/// Whether an error message looks like a dropped connection.
pub fn is_transport_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSPORT_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Map a failure message onto the signal vocabulary.
pub fn classify_failure(message: impl Into<String>) -> StreamSignal {
    let message = message.into();
    if is_transport_failure(&message) {
        StreamSignal::ConnectionLost { message }
    } else {
        StreamSignal::Error { message }
    }
}

/// Map a crate error onto the signal vocabulary.
pub fn classify_error(error: &RelayError) -> StreamSignal {
    match error {
        RelayError::InvalidStream(reason) => StreamSignal::InvalidStream {
            reason: reason.clone(),
        },
        RelayError::Transport(message) => StreamSignal::ConnectionLost {
            message: message.clone(),
        },
        RelayError::Network(e) if e.is_connect() || e.is_timeout() => {
            StreamSignal::ConnectionLost {
                message: e.to_string(),
            }
        }
        RelayError::Timeout(_) => StreamSignal::ConnectionLost {
            message: error.to_string(),
        },
        other => classify_failure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_patterns_become_connection_lost() {
        for message in [
            "read ECONNRESET",
            "Connection reset by peer",
            "request timed out",
            "socket hang up",
            "Network unreachable",
        ] {
            assert!(
                matches!(classify_failure(message), StreamSignal::ConnectionLost { .. }),
                "{message}"
            );
        }
    }

    #[test]
    fn other_failures_stay_generic_errors() {
        assert_eq!(
            classify_failure("model refused the request"),
            StreamSignal::Error {
                message: "model refused the request".into()
            }
        );
    }

    #[test]
    fn invalid_stream_error_maps_to_invalid_stream_signal() {
        let signal = classify_error(&RelayError::InvalidStream("empty".into()));
        assert_eq!(
            signal,
            StreamSignal::InvalidStream {
                reason: "empty".into()
            }
        );
    }
}
