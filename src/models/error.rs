//! Error types for pairgen.
//!
//! Failure classes:
//! - Source failures: a corpus cannot be read, that source contributes nothing
//! - Generation failures: provider errors, absorbed per job by the dispatcher
//! - Ledger failures: fatal, the run stops rather than lose completed work

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for pairgen.
#[derive(Debug, Error)]
pub enum PairgenError {
    // ═══════════════════════════════════════════════════════════════════
    // Expected failures (bad input, unreadable sources)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Source '{source_label}' unavailable: {reason}")]
    SourceUnavailable {
        source_label: String,
        reason: String,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // Infrastructure failures
    // ═══════════════════════════════════════════════════════════════════
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The ledger could not be written. Always fatal.
    #[error("Ledger write failed: {context}")]
    LedgerWrite {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Run cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════════
    // Invariant violations (bugs)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PairgenError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a ledger write error with context.
    pub fn ledger_write(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::LedgerWrite {
            context: context.into(),
            source,
        }
    }
}

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    /// Provider asked us to slow down (HTTP 429)
    RateLimited,
    /// Call exceeded its deadline
    Timeout,
    /// Reply did not satisfy the output schema
    MalformedOutput,
    /// Provider could not be reached or refused the request
    Unavailable,
}

impl std::fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Timeout => write!(f, "timeout"),
            Self::MalformedOutput => write!(f, "malformed_output"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Failure returned by a provider adapter.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
    /// Set for failures that no retry can fix (e.g. authentication).
    pub permanent: bool,
    /// Server-provided delay hint, if any.
    pub retry_after_secs: Option<f64>,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            permanent: false,
            retry_after_secs: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: Option<f64>) -> Self {
        Self {
            retry_after_secs,
            ..Self::new(GenerationErrorKind::RateLimited, message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::MalformedOutput, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Unavailable, message)
    }

    /// Mark this failure as not worth retrying.
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Check if this error should be retried by the adapter's retry policy.
    pub fn is_transient(&self) -> bool {
        !self.permanent
            && matches!(
                self.kind,
                GenerationErrorKind::RateLimited
                    | GenerationErrorKind::Timeout
                    | GenerationErrorKind::Unavailable
            )
    }
}

/// Result type alias for pairgen.
pub type Result<T> = std::result::Result<T, PairgenError>;
