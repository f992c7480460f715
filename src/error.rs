// =============================================================================
// Structured Error Taxonomy
// =============================================================================
//
// Every fallible operation in the core returns `CoreResult<T>`. Callers get a
// typed, structured error with `{kind, retryable, details}`; only retryable
// errors are retried (with bounded backoff, left to the caller's loop). Every
// non-retryable error that affects financial state should be escalated to a
// critical alert via `crate::notify::AlertDispatcher` by the caller that
// detects it — this module only classifies, it does not dispatch.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category. Each kind carries its own retry policy:
///
/// - `Validation` — malformed input. Never retryable; no state mutation.
/// - `ResourceUpstream` — store / market-data unreachable or timed out.
///   Retryable; callers apply kind-specific fallbacks (fail-open for the
///   rate limiter, fail-degrade for the cache, retry-with-fallback for the
///   router).
/// - `Exchange` — slice rejected or partially filled. Retryable once.
/// - `Logic` — invariant violation. Never retryable; fatal for the entity.
/// - `Configuration` — unknown algorithm/strategy at load time. Never
///   retryable; config is rejected outright, no silent default substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    ResourceUpstream,
    Exchange,
    Logic,
    Configuration,
}

impl ErrorKind {
    /// Default retry policy for the kind, used when a constructor does not
    /// override it explicitly.
    fn default_retryable(self) -> bool {
        matches!(self, Self::ResourceUpstream | Self::Exchange)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::ResourceUpstream => "resource_upstream",
            Self::Exchange => "exchange",
            Self::Logic => "logic",
            Self::Configuration => "configuration",
        };
        write!(f, "{s}")
    }
}

/// A structured core error: `{kind, retryable, details}`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {details}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub details: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.default_retryable(),
            details: details.into(),
        }
    }

    pub fn validation(details: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, details)
    }

    pub fn resource_upstream(details: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceUpstream, details)
    }

    pub fn exchange(details: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exchange, details)
    }

    /// Logic errors quarantine the affected entity; the caller must stop
    /// processing further mutations against it.
    pub fn logic(details: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, details)
    }

    pub fn configuration(details: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, details)
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Whether this error, left unresolved, affects financial state and
    /// should escalate to a critical alert.
    pub fn is_critical(&self) -> bool {
        matches!(self.kind, ErrorKind::Logic)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_upstream_defaults_retryable() {
        let e = CoreError::resource_upstream("store timeout");
        assert!(e.is_retryable());
        assert!(!e.is_critical());
    }

    #[test]
    fn logic_errors_are_critical_and_not_retryable() {
        let e = CoreError::logic("current_size went negative");
        assert!(!e.is_retryable());
        assert!(e.is_critical());
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        let e = CoreError::validation("reduce size exceeds current_size");
        assert!(!e.is_retryable());
    }
}
