//! Error types for the Dray engine.

use std::time::Duration;

use dray_core::SubmissionId;

/// The result type used throughout dray-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A submission was not found in the store.
    #[error("submission not found: {submission_id}")]
    SubmissionNotFound {
        /// The submission ID that was looked up.
        submission_id: SubmissionId,
    },

    /// A submission with the given identifier already exists.
    #[error("submission already exists: {submission_id}")]
    DuplicateSubmission {
        /// The conflicting submission ID.
        submission_id: SubmissionId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// An invalid lease mutation was attempted.
    #[error("invalid lease mutation: {message}")]
    InvalidLeaseMutation {
        /// Description of the rejected mutation.
        message: String,
    },

    /// A dispatch policy was misconfigured.
    #[error("invalid policy configuration: {message}")]
    PolicyConfiguration {
        /// Description of the configuration problem.
        message: String,
    },

    /// No task implementation is registered for a payload's task type.
    #[error("unknown task type: {task_type}")]
    UnknownTaskType {
        /// The task type tag that could not be resolved.
        task_type: String,
    },

    /// Task execution failed; carries the captured cause from the result record.
    #[error("submission {submission_id} failed: {cause}")]
    ExecutionFailed {
        /// The failed submission.
        submission_id: SubmissionId,
        /// The captured failure cause.
        cause: serde_json::Value,
    },

    /// The submission was cancelled before producing a result.
    #[error("submission cancelled: {submission_id}")]
    SubmissionCancelled {
        /// The cancelled submission.
        submission_id: SubmissionId,
    },

    /// Waiting for a submission outcome timed out.
    ///
    /// Distinct from [`Error::ExecutionFailed`]: the submission may still
    /// complete after this error is returned.
    #[error("timed out after {waited:?} waiting for submission {submission_id}")]
    OutcomeTimeout {
        /// The submission being awaited.
        submission_id: SubmissionId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The session or engine has been shut down.
    #[error("engine is shut down")]
    ShutDown,

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from dray-core.
    #[error("core error: {0}")]
    Core(#[from] dray_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "DONE".into(),
            to: "EXECUTING".into(),
            reason: "DONE is terminal".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("DONE"));
        assert!(msg.contains("EXECUTING"));
        assert!(msg.contains("terminal"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = Error::storage_with_source("failed to load record", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn timeout_is_distinct_from_failure() {
        let id = SubmissionId::generate();
        let timeout = Error::OutcomeTimeout {
            submission_id: id,
            waited: Duration::from_millis(250),
        };
        assert!(timeout.to_string().contains("timed out"));
        assert!(!matches!(timeout, Error::ExecutionFailed { .. }));
    }
}
