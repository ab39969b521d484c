//! Policy-driven routing across a registered processor set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use dray_core::ProcessorId;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::pending::PendingSubmission;
use crate::processor::TaskProcessorDefinition;

use super::policy::TaskDispatchPolicy;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("routed dispatcher lock poisoned")
}

/// Routes submissions to registered processors via a selection policy.
///
/// Group affinity is sticky: once a group key is routed to a processor,
/// later submissions with the same key go to it as long as it stays
/// registered and still satisfies the submission's attributes.
pub struct PolicyRoutedDispatcher {
    policy: Arc<dyn TaskDispatchPolicy>,
    processors: RwLock<Vec<TaskProcessorDefinition>>,
    affinity: Mutex<HashMap<String, ProcessorId>>,
}

impl PolicyRoutedDispatcher {
    /// Creates a dispatcher with no processors registered.
    #[must_use]
    pub fn new(policy: Arc<dyn TaskDispatchPolicy>) -> Self {
        Self {
            policy,
            processors: RwLock::new(Vec::new()),
            affinity: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a processor as a routing candidate.
    pub fn register_processor(&self, definition: TaskProcessorDefinition) -> Result<()> {
        self.processors.write().map_err(poison_err)?.push(definition);
        Ok(())
    }

    /// Removes a processor and any affinity entries pinned to it.
    ///
    /// Returns true if the processor was registered.
    pub fn deregister_processor(&self, id: &ProcessorId) -> Result<bool> {
        let removed = {
            let mut processors = self.processors.write().map_err(poison_err)?;
            let before = processors.len();
            processors.retain(|def| def.id != *id);
            processors.len() < before
        };
        if removed {
            self.affinity
                .lock()
                .map_err(poison_err)?
                .retain(|_, pinned| pinned != id);
        }
        Ok(removed)
    }

    /// Returns the registered candidate count.
    pub fn processor_count(&self) -> Result<usize> {
        Ok(self.processors.read().map_err(poison_err)?.len())
    }

    /// Resolves the target processor, honoring sticky group affinity.
    fn select_target(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Result<Option<TaskProcessorDefinition>> {
        if let Some(group) = &pending.configuration.group_affinity {
            let pinned = self.affinity.lock().map_err(poison_err)?.get(group).copied();
            if let Some(pinned) = pinned {
                if let Some(def) = candidates.iter().find(|def| {
                    def.id == pinned && def.matches_attributes(&pending.configuration.attributes)
                }) {
                    return Ok(Some(def.clone()));
                }
                // The pinned processor is gone or no longer suitable.
                self.affinity.lock().map_err(poison_err)?.remove(group);
            }
            let selected = self.policy.select(pending, candidates);
            if let Some(def) = &selected {
                self.affinity
                    .lock()
                    .map_err(poison_err)?
                    .insert(group.clone(), def.id);
            }
            return Ok(selected);
        }
        Ok(self.policy.select(pending, candidates))
    }
}

#[async_trait]
impl Dispatcher for PolicyRoutedDispatcher {
    fn name(&self) -> &str {
        "policy_routed"
    }

    async fn dispatch(&self, pending: &PendingSubmission) -> Result<DispatchOutcome> {
        let candidates: Vec<TaskProcessorDefinition> =
            self.processors.read().map_err(poison_err)?.clone();
        if candidates.is_empty() {
            return Ok(DispatchOutcome::Rejected);
        }
        let Some(target) = self.select_target(pending, &candidates)? else {
            return Ok(DispatchOutcome::Rejected);
        };
        debug!(
            submission_id = %pending.submission_id(),
            processor_id = %target.id,
            policy = self.policy.name(),
            "routed submission"
        );
        Ok(DispatchOutcome::Accepted { owner: target.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::policy::{AttributeMatchPolicy, RoundRobinPolicy};
    use crate::processor::ProcessorKind;
    use crate::submission::{SubmissionConfiguration, SubmissionKeyPair};
    use chrono::Utc;
    use dray_core::{ResultId, SubmissionId};
    use serde_json::json;

    fn definition() -> TaskProcessorDefinition {
        TaskProcessorDefinition::new(ProcessorId::generate(), "worker", ProcessorKind::Single)
    }

    fn pending(config: SubmissionConfiguration) -> PendingSubmission {
        PendingSubmission::new(
            SubmissionKeyPair::new(SubmissionId::generate(), ResultId::generate()),
            json!({}),
            config,
            Utc::now(),
        )
    }

    fn routed() -> PolicyRoutedDispatcher {
        PolicyRoutedDispatcher::new(Arc::new(RoundRobinPolicy::new()))
    }

    #[tokio::test]
    async fn rejects_with_no_processors() {
        let dispatcher = routed();
        let outcome = dispatcher
            .dispatch(&pending(SubmissionConfiguration::new()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Rejected);
    }

    #[tokio::test]
    async fn accepts_with_selected_owner() {
        let dispatcher = routed();
        let def = definition();
        dispatcher.register_processor(def.clone()).unwrap();

        let p = pending(SubmissionConfiguration::new());
        let outcome = dispatcher.dispatch(&p).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Accepted { owner: def.id });
    }

    #[tokio::test]
    async fn group_affinity_is_sticky() {
        let dispatcher = routed();
        dispatcher.register_processor(definition()).unwrap();
        dispatcher.register_processor(definition()).unwrap();
        dispatcher.register_processor(definition()).unwrap();

        let config = SubmissionConfiguration::new().with_group_affinity("tenant-a");
        let first = dispatcher.dispatch(&pending(config.clone())).await.unwrap();
        let DispatchOutcome::Accepted { owner } = first else {
            panic!("expected acceptance");
        };
        // Round-robin would rotate, but the group pin wins.
        for _ in 0..3 {
            let outcome = dispatcher.dispatch(&pending(config.clone())).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::Accepted { owner });
        }
    }

    #[tokio::test]
    async fn deregistration_clears_affinity() {
        let dispatcher = routed();
        let a = definition();
        let b = definition();
        dispatcher.register_processor(a.clone()).unwrap();
        dispatcher.register_processor(b.clone()).unwrap();

        let config = SubmissionConfiguration::new().with_group_affinity("tenant-b");
        let DispatchOutcome::Accepted { owner } =
            dispatcher.dispatch(&pending(config.clone())).await.unwrap()
        else {
            panic!("expected acceptance");
        };

        assert!(dispatcher.deregister_processor(&owner).unwrap());
        let DispatchOutcome::Accepted { owner: repinned } =
            dispatcher.dispatch(&pending(config)).await.unwrap()
        else {
            panic!("expected acceptance");
        };
        assert_ne!(repinned, owner);
    }

    #[tokio::test]
    async fn attribute_policy_rejects_unsatisfiable_requirements() {
        let dispatcher = PolicyRoutedDispatcher::new(Arc::new(AttributeMatchPolicy::new()));
        dispatcher.register_processor(definition()).unwrap();

        let config = SubmissionConfiguration::new().with_attribute("accelerator", "gpu");
        let outcome = dispatcher.dispatch(&pending(config)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Rejected);
    }
}
