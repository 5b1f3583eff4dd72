//! Typed error classification
//!
//! Every backend result crossing the scheduler or outbox boundary is mapped
//! onto one of the recovery classes below. The circuit breaker only acts on
//! `Fatal`; transport and timeout errors are retried locally; permission
//! errors go straight back to the caller.

use crate::core::BackendError;
use serde::{Deserialize, Serialize};

/// Recovery class of a backend error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Expected connectivity loss: queue and retry silently
    Transport,
    /// Backend-internal corruption: counted by the circuit breaker
    Fatal,
    /// Rules/auth rejection: surface unchanged, never retry
    Permission,
    /// Bounded retry with backoff, then surface
    Timeout,
    /// Anything else: surface unchanged
    Other,
}

impl ErrorClass {
    /// Whether the scheduler may retry this class on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Fatal => "fatal",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

/// Maps errors (and raw panic/diagnostic messages) to an `ErrorClass`
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    fatal_patterns: Vec<String>,
}

impl ErrorClassifier {
    pub fn new(fatal_patterns: Vec<String>) -> Self {
        Self { fatal_patterns }
    }

    pub fn classify(&self, error: &BackendError) -> ErrorClass {
        match error {
            BackendError::Offline | BackendError::Unavailable(_) => ErrorClass::Transport,
            BackendError::Timeout(_) => ErrorClass::Timeout,
            BackendError::PermissionDenied(_) | BackendError::Unauthenticated(_) => {
                ErrorClass::Permission
            }
            BackendError::Internal { message, .. } if self.is_fatal_message(message) => {
                ErrorClass::Fatal
            }
            BackendError::Internal { .. }
            | BackendError::NotFound(_)
            | BackendError::Terminated
            | BackendError::Other(_) => ErrorClass::Other,
        }
    }

    /// Classify a free-form message (uncaught panics, platform error hooks)
    pub fn classify_message(&self, message: &str) -> ErrorClass {
        if self.is_fatal_message(message) {
            ErrorClass::Fatal
        } else {
            ErrorClass::Other
        }
    }

    /// Whether an error belongs to the backend's internal/transient family
    /// (eligible for the scheduler's warm-up refresh-and-retry)
    pub fn is_internal_or_transient(&self, error: &BackendError) -> bool {
        matches!(
            error,
            BackendError::Internal { .. } | BackendError::Unavailable(_) | BackendError::Offline
        )
    }

    fn is_fatal_message(&self, message: &str) -> bool {
        self.fatal_patterns
            .iter()
            .any(|pattern| message.contains(pattern.as_str()))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(
            crate::config::constants::FATAL_ERROR_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_taxonomy() {
        let classifier = ErrorClassifier::default();

        assert_eq!(classifier.classify(&BackendError::Offline), ErrorClass::Transport);
        assert_eq!(
            classifier.classify(&BackendError::unavailable("503")),
            ErrorClass::Transport
        );
        assert_eq!(
            classifier.classify(&BackendError::Timeout(Duration::from_secs(1))),
            ErrorClass::Timeout
        );
        assert_eq!(
            classifier.classify(&BackendError::PermissionDenied("rules".into())),
            ErrorClass::Permission
        );
        assert_eq!(
            classifier.classify(&BackendError::Unauthenticated("expired".into())),
            ErrorClass::Permission
        );
    }

    #[test]
    fn test_only_assertion_failures_are_fatal() {
        let classifier = ErrorClassifier::default();

        let fatal = BackendError::internal("b815", "INTERNAL ASSERTION FAILED: Unexpected state");
        assert_eq!(classifier.classify(&fatal), ErrorClass::Fatal);

        let internal = BackendError::internal("already-exists", "duplicate listener");
        assert_eq!(classifier.classify(&internal), ErrorClass::Other);
        assert!(classifier.is_internal_or_transient(&internal));

        assert_eq!(
            classifier.classify_message("panicked: INTERNAL ASSERTION FAILED (id: ca9)"),
            ErrorClass::Fatal
        );
        assert_eq!(classifier.classify_message("index out of bounds"), ErrorClass::Other);
    }

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::Transport.is_retryable());
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
        assert!(!ErrorClass::Permission.is_retryable());
        assert!(!ErrorClass::Other.is_retryable());
    }
}
