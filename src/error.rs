//! Error taxonomy shared by providers, the rate limiter, the fallback chain
//! and the orchestrator.
//!
//! Provider adapters report failures as a [`ProviderError`] carrying an
//! [`ErrorKind`]. The kind decides whether the fallback chain treats the
//! failure as transient (advance to the next provider) or provider-fatal.
//! Everything above a single provider call is expressed as a [`SyncError`].

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Failure classes a provider adapter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    Network,
    Server,
    Auth,
    Api,
    Unknown,
}

impl ErrorKind {
    /// Wire prefix used in messages and logs (e.g. `rate_limit`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Auth => "auth",
            ErrorKind::Api => "api",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether another attempt (same or different provider) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Server
                | ErrorKind::Unknown
        )
    }

    /// Map an HTTP status code to a failure class.
    ///
    /// 429 is a rate limit, 401/403 are credential problems, 408/504 are
    /// timeouts, other 5xx are server errors and remaining 4xx are request
    /// errors the provider will never accept.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimit,
            401 | 403 => ErrorKind::Auth,
            408 | 504 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Server,
            400..=499 => ErrorKind::Api,
            _ => ErrorKind::Unknown,
        }
    }

    /// Parse a `kind: message` prefix produced by adapters that only return
    /// strings. Unrecognised prefixes map to `Unknown`.
    pub fn from_prefix(message: &str) -> Self {
        let prefix = message
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match prefix.as_str() {
            "rate_limit" => ErrorKind::RateLimit,
            "timeout" => ErrorKind::Timeout,
            "network" => ErrorKind::Network,
            "server" => ErrorKind::Server,
            "auth" => ErrorKind::Auth,
            "api" => ErrorKind::Api,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to a single provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from a `kind: message` string.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = ErrorKind::from_prefix(&message);
        let body = match message.split_once(':') {
            Some((_, rest)) if kind != ErrorKind::Unknown => rest.trim().to_string(),
            _ => message.clone(),
        };
        Self::new(kind, body)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// One provider's failure inside an exhausted chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.provider, self.error)
    }
}

/// Orchestration-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("queue_timeout: task for {provider} waited {waited:?} without being released")]
    QueueTimeout { provider: String, waited: Duration },

    #[error("key_too_long: key has {length} characters, maximum is {max}")]
    KeyTooLong { length: usize, max: usize },

    #[error("all_providers_exhausted: {}", format_failures(.failures))]
    AllProvidersExhausted { failures: Vec<ProviderFailure> },

    #[error("limiter_closed: rate limiter for {provider} has been destroyed")]
    LimiterClosed { provider: String },

    #[error("destroyed: orchestrator has been destroyed")]
    Destroyed,

    #[error("validation: {}", .issues.join("; "))]
    Validation { issues: Vec<String> },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl SyncError {
    /// Stable taxonomy code for logs and result objects.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::QueueTimeout { .. } => "queue_timeout",
            SyncError::KeyTooLong { .. } => "key_too_long",
            SyncError::AllProvidersExhausted { .. } => "all_providers_exhausted",
            SyncError::LimiterClosed { .. } => "limiter_closed",
            SyncError::Destroyed => "destroyed",
            SyncError::Validation { .. } => "validation",
            SyncError::Provider(e) => e.kind.as_str(),
        }
    }

    /// View this error as a provider failure so the fallback chain can
    /// account for it. Queue timeouts count as timeouts.
    pub fn as_provider_error(&self) -> ProviderError {
        match self {
            SyncError::Provider(e) => e.clone(),
            SyncError::QueueTimeout { .. } => {
                ProviderError::new(ErrorKind::Timeout, self.to_string())
            }
            SyncError::LimiterClosed { .. } => {
                ProviderError::new(ErrorKind::Unknown, self.to_string())
            }
            other => ProviderError::new(ErrorKind::Unknown, other.to_string()),
        }
    }
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Server.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::Api.is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::Api);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::Api);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::Server);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::Server);
        assert_eq!(ErrorKind::from_status(504), ErrorKind::Timeout);
    }

    #[test]
    fn test_provider_error_from_prefixed_message() {
        let err = ProviderError::from_message("rate_limit: slow down");
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.message, "slow down");
        assert_eq!(err.to_string(), "rate_limit: slow down");
    }

    #[test]
    fn test_provider_error_from_unprefixed_message() {
        let err = ProviderError::from_message("something odd happened");
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.message, "something odd happened");
    }

    #[test]
    fn test_exhausted_lists_every_provider() {
        let err = SyncError::AllProvidersExhausted {
            failures: vec![
                ProviderFailure {
                    provider: "a".to_string(),
                    error: ProviderError::new(ErrorKind::Server, "boom"),
                },
                ProviderFailure {
                    provider: "b".to_string(),
                    error: ProviderError::new(ErrorKind::Timeout, "slow"),
                },
            ],
        };

        let text = err.to_string();
        assert!(text.starts_with("all_providers_exhausted"));
        assert!(text.contains("a (server: boom)"));
        assert!(text.contains("b (timeout: slow)"));
        assert_eq!(err.code(), "all_providers_exhausted");
    }

    #[test]
    fn test_queue_timeout_counts_as_timeout() {
        let err = SyncError::QueueTimeout {
            provider: "p".to_string(),
            waited: Duration::from_millis(10),
        };
        assert_eq!(err.as_provider_error().kind, ErrorKind::Timeout);
        assert_eq!(err.code(), "queue_timeout");
    }

    #[test]
    fn test_code_of_provider_error_is_its_kind() {
        let err = SyncError::from(ProviderError::new(ErrorKind::Auth, "bad key"));
        assert_eq!(err.code(), "auth");
    }

    #[test]
    fn test_validation_error_lists_issues() {
        let err = SyncError::Validation {
            issues: vec!["Missing placeholder {name}".to_string(), "Too long".to_string()],
        };
        assert_eq!(err.code(), "validation");
        assert_eq!(err.to_string(), "validation: Missing placeholder {name}; Too long");
    }
}
