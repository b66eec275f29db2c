//!
//! # Error Classification
//!
//! Shared error plumbing for the outbox crates. Every module owns its own
//! `thiserror` enum; this module only provides the boxed error alias and the
//! category used to decide whether a failure is worth retrying.
//!

use serde::{Deserialize, Serialize};

/// Boxed error used at port boundaries where the concrete type belongs to an adapter.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error category for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCategory {
    /// Connection loss, timeouts, unavailable streams.
    /// Retried by the polling interval, the job queue or the resubscribe loop.
    Infrastructure = 1,

    /// Malformed input (bad subject shape, bad isolation level).
    /// Never retried.
    Validation = 2,

    /// Duplicate insert. Callers may treat it as an idempotent write.
    Conflict = 3,

    /// Panic recovered inside a unit of work.
    Panic = 4,
}

impl ErrorCategory {
    /// Whether an operation failing with this category may succeed on a later attempt.
    pub const fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Infrastructure)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Panic => "panic",
        };
        f.write_str(name)
    }
}

/// Implemented by error types that can be mapped onto an [`ErrorCategory`].
pub trait Classify {
    fn category(&self) -> ErrorCategory;

    fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_infrastructure_is_retryable() {
        assert!(ErrorCategory::Infrastructure.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::Conflict.is_retryable());
        assert!(!ErrorCategory::Panic.is_retryable());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Validation.to_string(), "validation");
        assert_eq!(ErrorCategory::Conflict.to_string(), "conflict");
    }
}
