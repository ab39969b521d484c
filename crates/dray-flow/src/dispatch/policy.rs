//! Processor selection policies for routed dispatch.
//!
//! A policy narrows a candidate set ([`TaskDispatchPolicy::eligible`]) and
//! picks one processor from it ([`TaskDispatchPolicy::select`]). Policies
//! are pure over their inputs apart from internal cursors, so routing
//! decisions are easy to test without a store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::pending::PendingSubmission;
use crate::processor::TaskProcessorDefinition;

/// Chooses which processor receives a pending submission.
pub trait TaskDispatchPolicy: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Narrows the candidate set. The default keeps every candidate.
    fn eligible(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Vec<TaskProcessorDefinition> {
        let _ = pending;
        candidates.to_vec()
    }

    /// Picks one processor from the eligible candidates, or `None` if no
    /// candidate can take the submission.
    fn select(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Option<TaskProcessorDefinition>;
}

/// Rotates through eligible processors with a shared cursor.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates a policy with its cursor at the first candidate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskDispatchPolicy for RoundRobinPolicy {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Option<TaskProcessorDefinition> {
        let eligible = self.eligible(pending, candidates);
        if eligible.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index].clone())
    }
}

/// Picks a uniformly random eligible processor.
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl RandomPolicy {
    /// Creates the policy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TaskDispatchPolicy for RandomPolicy {
    fn name(&self) -> &str {
        "random"
    }

    fn select(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Option<TaskProcessorDefinition> {
        let eligible = self.eligible(pending, candidates);
        eligible.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Keeps only processors whose attributes are a superset of the
/// submission's required attributes, breaking ties round-robin.
#[derive(Debug, Default)]
pub struct AttributeMatchPolicy {
    tiebreak: RoundRobinPolicy,
}

impl AttributeMatchPolicy {
    /// Creates the policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskDispatchPolicy for AttributeMatchPolicy {
    fn name(&self) -> &str {
        "attribute_match"
    }

    fn eligible(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Vec<TaskProcessorDefinition> {
        candidates
            .iter()
            .filter(|def| def.matches_attributes(&pending.configuration.attributes))
            .cloned()
            .collect()
    }

    fn select(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Option<TaskProcessorDefinition> {
        let eligible = self.eligible(pending, candidates);
        self.tiebreak.select(pending, &eligible)
    }
}

/// Chains a narrowing policy into a selecting policy.
///
/// The first member's [`TaskDispatchPolicy::eligible`] narrows the
/// candidate set and the second member selects from the remainder.
pub struct CompositePolicy {
    members: Vec<Arc<dyn TaskDispatchPolicy>>,
}

impl CompositePolicy {
    /// Builds a composite from exactly two members.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyConfiguration`] for any other member count;
    /// longer chains have no defined narrowing semantics.
    pub fn try_new(members: Vec<Arc<dyn TaskDispatchPolicy>>) -> Result<Self> {
        if members.len() != 2 {
            return Err(Error::PolicyConfiguration {
                message: format!(
                    "composite policy requires exactly 2 members, got {}",
                    members.len()
                ),
            });
        }
        Ok(Self { members })
    }
}

impl TaskDispatchPolicy for CompositePolicy {
    fn name(&self) -> &str {
        "composite"
    }

    fn eligible(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Vec<TaskProcessorDefinition> {
        self.members[0].eligible(pending, candidates)
    }

    fn select(
        &self,
        pending: &PendingSubmission,
        candidates: &[TaskProcessorDefinition],
    ) -> Option<TaskProcessorDefinition> {
        let narrowed = self.eligible(pending, candidates);
        self.members[1].select(pending, &narrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorKind;
    use crate::submission::{SubmissionConfiguration, SubmissionKeyPair};
    use chrono::Utc;
    use dray_core::{ProcessorId, ResultId, SubmissionId};
    use serde_json::json;

    fn definition(attrs: &[(&str, &str)]) -> TaskProcessorDefinition {
        let mut def = TaskProcessorDefinition::new(
            ProcessorId::generate(),
            "worker",
            ProcessorKind::Single,
        );
        for (k, v) in attrs {
            def = def.with_attribute(*k, *v);
        }
        def
    }

    fn pending_with_attributes(attrs: &[(&str, &str)]) -> PendingSubmission {
        let mut config = SubmissionConfiguration::new();
        for (k, v) in attrs {
            config = config.with_attribute(*k, *v);
        }
        PendingSubmission::new(
            SubmissionKeyPair::new(SubmissionId::generate(), ResultId::generate()),
            json!({}),
            config,
            Utc::now(),
        )
    }

    #[test]
    fn round_robin_rotates() {
        let policy = RoundRobinPolicy::new();
        let candidates = vec![definition(&[]), definition(&[]), definition(&[])];
        let pending = pending_with_attributes(&[]);

        let picks: Vec<_> = (0..3)
            .map(|_| policy.select(&pending, &candidates).unwrap().id)
            .collect();
        assert_eq!(picks[0], candidates[0].id);
        assert_eq!(picks[1], candidates[1].id);
        assert_eq!(picks[2], candidates[2].id);
        assert_eq!(
            policy.select(&pending, &candidates).unwrap().id,
            candidates[0].id
        );
    }

    #[test]
    fn round_robin_empty_candidates() {
        let policy = RoundRobinPolicy::new();
        assert!(policy.select(&pending_with_attributes(&[]), &[]).is_none());
    }

    #[test]
    fn random_picks_from_candidates() {
        let policy = RandomPolicy::new();
        let candidates = vec![definition(&[]), definition(&[])];
        let pending = pending_with_attributes(&[]);
        let pick = policy.select(&pending, &candidates).unwrap();
        assert!(candidates.iter().any(|c| c.id == pick.id));
    }

    #[test]
    fn attribute_match_requires_superset() {
        let policy = AttributeMatchPolicy::new();
        let gpu = definition(&[("accelerator", "gpu"), ("zone", "a")]);
        let cpu = definition(&[("zone", "a")]);
        let candidates = vec![cpu, gpu.clone()];
        let pending = pending_with_attributes(&[("accelerator", "gpu")]);

        let eligible = policy.eligible(&pending, &candidates);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, gpu.id);
        assert_eq!(policy.select(&pending, &candidates).unwrap().id, gpu.id);
    }

    #[test]
    fn attribute_match_with_no_match() {
        let policy = AttributeMatchPolicy::new();
        let candidates = vec![definition(&[("zone", "a")])];
        let pending = pending_with_attributes(&[("zone", "b")]);
        assert!(policy.select(&pending, &candidates).is_none());
    }

    #[test]
    fn composite_requires_exactly_two_members() {
        let one: Vec<Arc<dyn TaskDispatchPolicy>> = vec![Arc::new(RoundRobinPolicy::new())];
        assert!(matches!(
            CompositePolicy::try_new(one),
            Err(Error::PolicyConfiguration { .. })
        ));

        let three: Vec<Arc<dyn TaskDispatchPolicy>> = vec![
            Arc::new(RoundRobinPolicy::new()),
            Arc::new(RandomPolicy::new()),
            Arc::new(RoundRobinPolicy::new()),
        ];
        assert!(CompositePolicy::try_new(three).is_err());
    }

    #[test]
    fn composite_narrows_then_selects() {
        let composite = CompositePolicy::try_new(vec![
            Arc::new(AttributeMatchPolicy::new()) as Arc<dyn TaskDispatchPolicy>,
            Arc::new(RoundRobinPolicy::new()),
        ])
        .unwrap();

        let gpu = definition(&[("accelerator", "gpu")]);
        let candidates = vec![definition(&[]), gpu.clone()];
        let pending = pending_with_attributes(&[("accelerator", "gpu")]);

        assert_eq!(composite.select(&pending, &candidates).unwrap().id, gpu.id);
    }
}
