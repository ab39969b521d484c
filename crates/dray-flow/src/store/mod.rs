//! Pluggable storage for submissions, results, checkpoints, and
//! assignment queues.
//!
//! The engine assumes a reliable shared keyed store with conditional-put
//! and change-notification semantics; this module is the narrow interface
//! it consumes. Dray does not implement durable storage itself.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: State transitions use compare-and-swap so concurrent
//!   dispatch and expiry-triggered retry for the same key cannot both
//!   succeed; the loser observes a no-op
//! - **Change notifications**: Subscribers observe updates keyed by
//!   identifier, used by outcome handles and processors
//! - **Testability**: In-memory implementation for tests and local use

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use dray_core::{ProcessorId, SubmissionId};

use crate::error::Result;
use crate::submission::{
    StateTransitionReason, Submission, SubmissionKeyPair, SubmissionResult, SubmissionState,
};

/// Result of a conditional store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Operation succeeded.
    Success,
    /// Entity not found.
    NotFound,
    /// State didn't match expected value.
    StateMismatch {
        /// The actual state that was found.
        actual: SubmissionState,
    },
    /// A conditional insert found an existing entry.
    AlreadyExists,
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the entity was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Change notification emitted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A submission record changed state.
    SubmissionUpdated {
        /// The submission that changed.
        submission_id: SubmissionId,
        /// Its state after the change.
        state: SubmissionState,
    },
    /// A result record was written.
    ResultUpdated {
        /// The owning submission.
        submission_id: SubmissionId,
    },
    /// A key pair was appended to a processor's assignment queue.
    AssignmentQueued {
        /// The processor whose queue grew.
        processor_id: ProcessorId,
    },
    /// A submission/result pair was removed.
    PairRemoved {
        /// The removed submission.
        submission_id: SubmissionId,
    },
}

/// Storage abstraction for engine state.
///
/// Implementations must provide conditional-put-if-absent for pair
/// creation, CAS for state transitions, and a change-notification stream.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// controller loop, processor pools, and outcome handles.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    // --- Submission/result pair operations ---

    /// Atomically creates a submission and its paired result record.
    ///
    /// Returns [`CasResult::AlreadyExists`] without writing if a submission
    /// with the same identifier exists.
    async fn put_pair_if_absent(
        &self,
        submission: &Submission,
        result: &SubmissionResult,
    ) -> Result<CasResult>;

    /// Gets a submission by ID. Returns `None` if it does not exist.
    async fn get_submission(&self, id: &SubmissionId) -> Result<Option<Submission>>;

    /// Saves a submission (full replacement).
    ///
    /// For concurrent state changes use [`SubmissionStore::cas_submission_state`].
    async fn save_submission(&self, submission: &Submission) -> Result<()>;

    /// Atomically transitions submission state if the current state matches.
    ///
    /// This is the core primitive for distributed correctness: concurrent
    /// dispatch and expiry-triggered retry for one key are serialized here.
    async fn cas_submission_state(
        &self,
        id: &SubmissionId,
        expected: SubmissionState,
        target: SubmissionState,
        reason: StateTransitionReason,
    ) -> Result<CasResult>;

    /// Sets or clears the owning processor of a submission.
    async fn set_owner(&self, id: &SubmissionId, owner: Option<ProcessorId>) -> Result<()>;

    /// Gets the result record paired with a submission.
    async fn get_result(&self, id: &SubmissionId) -> Result<Option<SubmissionResult>>;

    /// Saves a result record (full replacement).
    async fn save_result(&self, result: &SubmissionResult) -> Result<()>;

    /// Removes a submission/result pair and its checkpoint.
    ///
    /// Returns true if a pair was removed; removing an unknown identifier
    /// is a no-op returning false.
    async fn remove_pair(&self, id: &SubmissionId) -> Result<bool>;

    /// Lists all known submission identifiers.
    async fn submission_ids(&self) -> Result<Vec<SubmissionId>>;

    /// Lists non-terminal submissions owned by a processor.
    async fn submissions_owned_by(&self, owner: &ProcessorId) -> Result<Vec<Submission>>;

    // --- Checkpoint operations ---

    /// Persists the checkpoint for a submission, replacing any prior one.
    async fn save_checkpoint(&self, id: &SubmissionId, checkpoint: &Value) -> Result<()>;

    /// Loads the checkpoint for a submission, if one was persisted.
    async fn load_checkpoint(&self, id: &SubmissionId) -> Result<Option<Value>>;

    /// Removes the checkpoint for a submission.
    async fn remove_checkpoint(&self, id: &SubmissionId) -> Result<bool>;

    // --- Assignment queue operations ---

    /// Appends a key pair to a processor's assignment queue.
    async fn append_assignment(
        &self,
        processor: &ProcessorId,
        key: &SubmissionKeyPair,
    ) -> Result<()>;

    /// Drains a processor's assignment queue in order.
    ///
    /// Used both for startup recovery and for reacting to new assignments.
    async fn drain_assignments(&self, processor: &ProcessorId) -> Result<Vec<SubmissionKeyPair>>;

    // --- Change notifications ---

    /// Subscribes to store change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(!CasResult::AlreadyExists.is_success());
        assert!(!CasResult::StateMismatch {
            actual: SubmissionState::Executing
        }
        .is_success());
    }

    #[test]
    fn cas_result_is_not_found() {
        assert!(CasResult::NotFound.is_not_found());
        assert!(!CasResult::Success.is_not_found());
    }
}
