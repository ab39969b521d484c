//! In-memory store implementation for testing and local use.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use dray_core::{ProcessorId, SubmissionId};

use super::{CasResult, StoreEvent, SubmissionStore};
use crate::error::{Error, Result};
use crate::submission::{
    StateTransitionReason, Submission, SubmissionKeyPair, SubmissionResult, SubmissionState,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory store backed by `RwLock`-guarded maps.
#[derive(Debug)]
pub struct InMemoryStore {
    submissions: RwLock<HashMap<SubmissionId, Submission>>,
    results: RwLock<HashMap<SubmissionId, SubmissionResult>>,
    checkpoints: RwLock<HashMap<SubmissionId, Value>>,
    assignments: RwLock<HashMap<ProcessorId, VecDeque<SubmissionKeyPair>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            submissions: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Returns the number of stored submissions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn submission_count(&self) -> Result<usize> {
        let count = {
            let submissions = self.submissions.read().map_err(poison_err)?;
            submissions.len()
        };
        Ok(count)
    }

    fn publish(&self, event: StoreEvent) {
        // Nobody listening is fine; outcome handles subscribe lazily.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SubmissionStore for InMemoryStore {
    async fn put_pair_if_absent(
        &self,
        submission: &Submission,
        result: &SubmissionResult,
    ) -> Result<CasResult> {
        {
            let mut submissions = self.submissions.write().map_err(poison_err)?;
            if submissions.contains_key(&submission.id) {
                return Ok(CasResult::AlreadyExists);
            }
            let mut results = self.results.write().map_err(poison_err)?;
            submissions.insert(submission.id, submission.clone());
            results.insert(submission.id, result.clone());
        }
        self.publish(StoreEvent::SubmissionUpdated {
            submission_id: submission.id,
            state: submission.state,
        });
        Ok(CasResult::Success)
    }

    async fn get_submission(&self, id: &SubmissionId) -> Result<Option<Submission>> {
        let result = {
            let submissions = self.submissions.read().map_err(poison_err)?;
            submissions.get(id).cloned()
        };
        Ok(result)
    }

    async fn save_submission(&self, submission: &Submission) -> Result<()> {
        {
            let mut submissions = self.submissions.write().map_err(poison_err)?;
            submissions.insert(submission.id, submission.clone());
        }
        self.publish(StoreEvent::SubmissionUpdated {
            submission_id: submission.id,
            state: submission.state,
        });
        Ok(())
    }

    async fn cas_submission_state(
        &self,
        id: &SubmissionId,
        expected: SubmissionState,
        target: SubmissionState,
        reason: StateTransitionReason,
    ) -> Result<CasResult> {
        let outcome = {
            let mut submissions = self.submissions.write().map_err(poison_err)?;
            let Some(submission) = submissions.get_mut(id) else {
                return Ok(CasResult::NotFound);
            };
            if submission.state != expected {
                return Ok(CasResult::StateMismatch {
                    actual: submission.state,
                });
            }
            submission.transition_to_with_reason(target, reason)?;
            submission.state
        };
        self.publish(StoreEvent::SubmissionUpdated {
            submission_id: *id,
            state: outcome,
        });
        Ok(CasResult::Success)
    }

    async fn set_owner(&self, id: &SubmissionId, owner: Option<ProcessorId>) -> Result<()> {
        let mut submissions = self.submissions.write().map_err(poison_err)?;
        if let Some(submission) = submissions.get_mut(id) {
            submission.owner = owner;
        }
        Ok(())
    }

    async fn get_result(&self, id: &SubmissionId) -> Result<Option<SubmissionResult>> {
        let result = {
            let results = self.results.read().map_err(poison_err)?;
            results.get(id).cloned()
        };
        Ok(result)
    }

    async fn save_result(&self, result: &SubmissionResult) -> Result<()> {
        {
            let mut results = self.results.write().map_err(poison_err)?;
            results.insert(result.submission_id, result.clone());
        }
        self.publish(StoreEvent::ResultUpdated {
            submission_id: result.submission_id,
        });
        Ok(())
    }

    async fn remove_pair(&self, id: &SubmissionId) -> Result<bool> {
        let removed = {
            let mut submissions = self.submissions.write().map_err(poison_err)?;
            let mut results = self.results.write().map_err(poison_err)?;
            let mut checkpoints = self.checkpoints.write().map_err(poison_err)?;
            results.remove(id);
            checkpoints.remove(id);
            submissions.remove(id).is_some()
        };
        if removed {
            self.publish(StoreEvent::PairRemoved {
                submission_id: *id,
            });
        }
        Ok(removed)
    }

    async fn submission_ids(&self) -> Result<Vec<SubmissionId>> {
        let mut ids: Vec<SubmissionId> = {
            let submissions = self.submissions.read().map_err(poison_err)?;
            submissions.keys().copied().collect()
        };
        ids.sort_unstable();
        Ok(ids)
    }

    async fn submissions_owned_by(&self, owner: &ProcessorId) -> Result<Vec<Submission>> {
        let result = {
            let submissions = self.submissions.read().map_err(poison_err)?;
            submissions
                .values()
                .filter(|s| s.owner == Some(*owner) && !s.is_terminal())
                .cloned()
                .collect()
        };
        Ok(result)
    }

    async fn save_checkpoint(&self, id: &SubmissionId, checkpoint: &Value) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().map_err(poison_err)?;
        checkpoints.insert(*id, checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, id: &SubmissionId) -> Result<Option<Value>> {
        let result = {
            let checkpoints = self.checkpoints.read().map_err(poison_err)?;
            checkpoints.get(id).cloned()
        };
        Ok(result)
    }

    async fn remove_checkpoint(&self, id: &SubmissionId) -> Result<bool> {
        let mut checkpoints = self.checkpoints.write().map_err(poison_err)?;
        Ok(checkpoints.remove(id).is_some())
    }

    async fn append_assignment(
        &self,
        processor: &ProcessorId,
        key: &SubmissionKeyPair,
    ) -> Result<()> {
        {
            let mut assignments = self.assignments.write().map_err(poison_err)?;
            assignments.entry(*processor).or_default().push_back(*key);
        }
        self.publish(StoreEvent::AssignmentQueued {
            processor_id: *processor,
        });
        Ok(())
    }

    async fn drain_assignments(&self, processor: &ProcessorId) -> Result<Vec<SubmissionKeyPair>> {
        let drained = {
            let mut assignments = self.assignments.write().map_err(poison_err)?;
            assignments
                .get_mut(processor)
                .map(|queue| queue.drain(..).collect())
                .unwrap_or_default()
        };
        Ok(drained)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
