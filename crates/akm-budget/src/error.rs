//! Budget error types.

use crate::tracker::BudgetScope;

/// Unified error type for the budget tracker.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// The provider has used up its configured budget for the period.
    /// Carries the usage figures so callers can report them.
    #[error("provider '{provider}' {scope} limit exceeded ({used}/{limit})")]
    Exceeded {
        provider: String,
        scope: BudgetScope,
        used: u64,
        limit: u64,
    },

    /// Writing or renaming the budget file failed.
    #[error("persistence failed: {reason}")]
    Persistence { reason: String },

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the budget crate.
pub type Result<T> = std::result::Result<T, BudgetError>;
