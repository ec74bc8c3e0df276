//! Error types for shardmesh cluster operations.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on operation criticality:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where partial success is worse than failure:
//! - Multi-key lock acquisition (a partial lock set is rolled back)
//! - Rebalance plan push/acknowledge exchanges
//! - Fan-out writes
//!
//! ## Best-Effort (Accumulate and Continue)
//!
//! Used where partial progress is still useful:
//! - `unlock_many` (failed keys are returned to the caller, the rest are
//!   released)
//! - Late results from timed-out fan-out calls (discarded, not errors)
//!
//! Unexpected task failures (panicked workers, dropped channels) are wrapped
//! into [`Error::Send`] rather than silently dropped, preserving a
//! user-visible failure instead of masking bugs.

use thiserror::Error;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal state of a distributed transaction when a commit or rollback
/// could not complete cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction committed on some participants but not all.
    PartiallyCommitted,
    /// The transaction rolled back on some participants but not all.
    PartiallyRolledBack,
    /// The outcome is unknown (participant unreachable mid-commit).
    Unknown,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::PartiallyCommitted => write!(f, "partially-committed"),
            TransactionState::PartiallyRolledBack => write!(f, "partially-rolled-back"),
            TransactionState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors that can occur in cluster coordination and data operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure to dispatch a message.
    ///
    /// Also wraps unexpected failures from worker tasks (panics, dropped
    /// result channels) so they surface to the caller instead of vanishing.
    #[error("send failure: {0}")]
    Send(String),

    /// No response, or an incomplete set of responses, within the budget.
    ///
    /// Carries how far the operation got for diagnostics: `completed` of
    /// `expected` sub-operations finished before the budget ran out.
    #[error("timeout: {completed}/{expected} completed within budget")]
    Timeout { completed: usize, expected: usize },

    /// Index-related operation against a non-existent or wrong-kind index.
    #[error("illegal index '{name}': {reason}")]
    IllegalIndex { name: String, reason: String },

    /// Optimistic version mismatch on a differential update.
    #[error("update conflict: expected version {expected}, found {actual}")]
    UpdateConflict { expected: u64, actual: u64 },

    /// Commit/rollback inconsistency; carries the resulting transaction state.
    #[error("transaction failure ({state}): {message}")]
    Transaction {
        state: TransactionState,
        message: String,
    },

    /// Rejected or unsupported configuration.
    ///
    /// Returned by capability checks (for example persistence delegation with
    /// no store configured) instead of signaling via panics.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a timeout error from fan-out progress counters.
    pub fn timeout(completed: usize, expected: usize) -> Self {
        Error::Timeout {
            completed,
            expected,
        }
    }

    /// True if the operation may succeed if simply retried.
    ///
    /// Timeouts and transport failures are transient; configuration errors,
    /// conflicts, and transaction inconsistencies need intervention.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Send(_) | Error::Timeout { .. })
    }

    /// True if this is a timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
