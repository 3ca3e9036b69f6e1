//! Unified error handling for the pressline crate
//!
//! Domain-specific error enums live here together with a unified [`Error`]
//! wrapper used across module boundaries. Errors are classified by
//! [`ErrorCategory`], which drives the handling policy:
//!
//! - `Recoverable` - one task failed; log, skip, keep the pool running
//! - `Contract` - a bookkeeping bug (double-initiate, done-without-initiate);
//!   always raised, never swallowed, fails the run
//! - `Fatal` - affects the whole run; unwinds via the run state machine
//! - `Cancelled` - operator-requested; claimed rows are left for retry and
//!   no error is recorded

use thiserror::Error;

use crate::models::{HandledKey, PublishTarget};

/// Result type using the unified [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Error Categories
// ============================================================================

/// Classification of errors for handling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Single-task failure; the run continues.
    Recoverable,
    /// Bookkeeping contract violation; the run must fail.
    Contract,
    /// Run-level failure.
    Fatal,
    /// Operator-requested cancellation; not an error condition.
    Cancelled,
    /// Persistence-layer failure.
    Storage,
    /// Cross-instance delegation failure.
    Cluster,
    /// Configuration or validation failure.
    Config,
}

/// Common interface implemented by pressline error types.
pub trait PublishErrorExt {
    /// Whether the run can continue after this error.
    fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Recoverable
    }

    /// The error category for handling strategies.
    fn category(&self) -> ErrorCategory;
}

// ============================================================================
// Queue Errors
// ============================================================================

/// Errors raised by the dirty-object queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Persistence collaborator failure.
    #[error("queue storage error: {0}")]
    Storage(String),

    /// A publish target was initiated twice for the same object.
    #[error("publish target {target} already initiated for {key}")]
    AlreadyInitiated {
        key: HandledKey,
        target: PublishTarget,
    },

    /// A publish target was reported done without being initiated.
    #[error("publish target {target} was never initiated for {key}")]
    NotInitiated {
        key: HandledKey,
        target: PublishTarget,
    },

    /// `end_batch`/`cancel_batch` called without an active batch.
    #[error("no dependency-dirt batch is active")]
    NoActiveBatch,

    /// `begin_batch` called while a batch is already collecting.
    #[error("a dependency-dirt batch is already active")]
    BatchAlreadyActive,

    /// The background remover has shut down.
    #[error("background queue remover unavailable: {0}")]
    RemoverUnavailable(String),
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Storage(format!("{err:#}"))
    }
}

impl PublishErrorExt for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Storage(_) | QueueError::RemoverUnavailable(_) => ErrorCategory::Storage,
            QueueError::AlreadyInitiated { .. }
            | QueueError::NotInitiated { .. }
            | QueueError::NoActiveBatch
            | QueueError::BatchAlreadyActive => ErrorCategory::Contract,
        }
    }
}

// ============================================================================
// Run Errors
// ============================================================================

/// Errors raised by the run state machine.
#[derive(Error, Debug)]
pub enum RunError {
    /// A publish run is already active in the cluster.
    #[error("a publish run is already active")]
    AlreadyRunning,

    /// Transition not allowed from the current state.
    #[error("invalid run state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// The driving task disappeared without reporting back.
    #[error("publish driver exited abnormally: {0}")]
    DriverFailed(String),
}

impl PublishErrorExt for RunError {
    fn category(&self) -> ErrorCategory {
        match self {
            RunError::AlreadyRunning => ErrorCategory::Config,
            RunError::InvalidTransition { .. } => ErrorCategory::Contract,
            RunError::DriverFailed(_) => ErrorCategory::Fatal,
        }
    }
}

// ============================================================================
// Cluster Errors
// ============================================================================

/// Errors raised by cross-instance delegation.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Transport-level failure talking to the owning instance.
    #[error("cluster transport error: {0}")]
    Transport(String),

    /// The owning instance answered with an application error.
    #[error("remote instance rejected the call: {0}")]
    Remote(String),

    /// Local delegation target failed.
    #[error("local run controller error: {0}")]
    Local(String),

    /// Client/server setup failure.
    #[error("cluster initialization error: {0}")]
    Init(String),
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl PublishErrorExt for ClusterError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Cluster
    }
}

// ============================================================================
// Publish (worker-level) Errors
// ============================================================================

/// Errors surfaced by the render/write collaborators for one task.
#[derive(Error, Debug)]
pub enum PublishError {
    /// One task failed; log, skip, continue.
    #[error("recoverable publish error: {0}")]
    Recoverable(String),

    /// The run cannot continue.
    #[error("fatal publish error: {0}")]
    Fatal(String),
}

impl PublishErrorExt for PublishError {
    fn category(&self) -> ErrorCategory {
        match self {
            PublishError::Recoverable(_) => ErrorCategory::Recoverable,
            PublishError::Fatal(_) => ErrorCategory::Fatal,
        }
    }
}

// ============================================================================
// Unified Error
// ============================================================================

/// Unified error type for the pressline crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("run error: {0}")]
    Run(#[from] RunError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Progress/history persistence failure.
    #[error("progress tracking error: {0}")]
    Progress(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled by the operator.
    #[error("publish run cancelled")]
    Cancelled,
}

impl PublishErrorExt for Error {
    fn category(&self) -> ErrorCategory {
        match self {
            Error::Queue(e) => e.category(),
            Error::Run(e) => e.category(),
            Error::Cluster(e) => e.category(),
            Error::Publish(e) => e.category(),
            Error::Progress(_) => ErrorCategory::Storage,
            Error::Config(_) => ErrorCategory::Config,
            Error::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

impl Error {
    /// Whether this error is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObjectRef, PublishTarget};

    #[test]
    fn test_contract_violations_are_not_recoverable() {
        let key = HandledKey::new(ObjectRef::page(1), 1);
        let err = QueueError::AlreadyInitiated {
            key,
            target: PublishTarget::Filesystem,
        };
        assert_eq!(err.category(), ErrorCategory::Contract);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable_publish_error() {
        let err = PublishError::Recoverable("render timeout".into());
        assert!(err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Recoverable);

        let fatal = PublishError::Fatal("repository offline".into());
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn test_unified_error_categories() {
        let err: Error = QueueError::NoActiveBatch.into();
        assert_eq!(err.category(), ErrorCategory::Contract);

        assert_eq!(Error::Cancelled.category(), ErrorCategory::Cancelled);
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let key = HandledKey::new(ObjectRef::page(42), 3);
        let err = QueueError::NotInitiated {
            key,
            target: PublishTarget::SearchIndex,
        };
        let msg = err.to_string();
        assert!(msg.contains("page:42@3"));
        assert!(msg.contains("search_index"));
    }
}
