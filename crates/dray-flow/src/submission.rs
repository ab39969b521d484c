//! Submission lifecycle state and records.
//!
//! This module provides:
//! - `SubmissionState`: The lifecycle state machine for accepted work
//! - `StateTransitionReason`: Explicit reasons for all state transitions
//! - `Submission`: The unit of accepted work
//! - `SubmissionResult`: The mutable record paired 1:1 with a submission
//! - `SubmissionConfiguration`: Per-submission routing and delay options
//! - `SubmissionKeyPair`: Stable addressing for a submission plus its result

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dray_core::{ProcessorId, ResultId, SubmissionId};

use crate::error::{Error, Result};

/// Reason for a submission state transition.
///
/// Every transition carries an explicit reason for auditing, metrics,
/// and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTransitionReason {
    /// Client submitted the work and it was accepted.
    SubmissionAccepted,
    /// A dispatcher accepted the pending submission.
    DispatchAccepted,
    /// The owning processor began execution.
    ExecutionStarted,
    /// Execution produced a terminal result.
    ExecutionSucceeded,
    /// Execution failed; the cause is captured in the result record.
    ExecutionFailed,
    /// The task voluntarily checkpointed and yielded.
    TaskYielded,
    /// A suspended submission was re-accepted by a dispatcher.
    ResumeDispatched,
    /// The owning processor's lease expired.
    LeaseExpired,
    /// Recovered work was re-enqueued for dispatch.
    RetryRequeued,
    /// A dispatcher aborted the dispatch attempt.
    DispatchAborted,
    /// The client cancelled the submission.
    UserCancelled,
}

impl std::fmt::Display for StateTransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::SubmissionAccepted => "submission_accepted",
            Self::DispatchAccepted => "dispatch_accepted",
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionSucceeded => "execution_succeeded",
            Self::ExecutionFailed => "execution_failed",
            Self::TaskYielded => "task_yielded",
            Self::ResumeDispatched => "resume_dispatched",
            Self::LeaseExpired => "lease_expired",
            Self::RetryRequeued => "retry_requeued",
            Self::DispatchAborted => "dispatch_aborted",
            Self::UserCancelled => "user_cancelled",
        };
        write!(f, "{label}")
    }
}

/// Submission lifecycle state machine.
///
/// States follow a directed graph:
/// ```text
/// ┌─────────┐    ┌───────────┐    ┌──────────┐    ┌───────────┐
/// │ INITIAL │───►│ SUBMITTED │───►│ ASSIGNED │───►│ EXECUTING │
/// └─────────┘    └───────────┘    └──────────┘    └───────────┘
///                      ▲             │    ▲         │   │   │
///                      │        lease│    │re-      │   │   └──────────┐
///                      │      expired│    │dispatch │   │              ▼
///                      │             ▼    │         │   │        ┌───────────┐
///                ┌───────┐        ┌───────┴───┐     │   │        │ SUSPENDED │
///                │ RETRY │        │ SUSPENDED │◄────┘   │        └───────────┘
///                └───┬───┘        └───────────┘         │
///                    │                                  ▼
///                    └────────────────────► {DONE | FAILED | CANCELLED}
/// ```
///
/// `DONE`, `FAILED`, and `CANCELLED` are terminal. Cancellation is legal
/// from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
    /// Created, not yet accepted for dispatch.
    Initial,
    /// Accepted, awaiting assignment to a processor.
    Submitted,
    /// A dispatcher accepted it; owned by a processor.
    Assigned,
    /// The owning processor is executing it.
    Executing,
    /// The task checkpointed and yielded; awaiting re-dispatch.
    Suspended,
    /// The owner's lease expired; about to be re-submitted.
    Retry,
    /// Completed successfully.
    Done,
    /// Failed; the cause lives in the result record.
    Failed,
    /// Cancelled by the client.
    Cancelled,
}

impl SubmissionState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Initial => matches!(target, Self::Submitted | Self::Cancelled),
            // Done/Failed from Submitted and Suspended cover dispatch aborts,
            // which finalize without the submission ever being assigned.
            Self::Submitted => {
                matches!(target, Self::Assigned | Self::Done | Self::Failed | Self::Cancelled)
            }
            Self::Assigned => {
                matches!(target, Self::Executing | Self::Retry | Self::Cancelled)
            }
            Self::Executing => matches!(
                target,
                Self::Done | Self::Failed | Self::Suspended | Self::Retry | Self::Cancelled
            ),
            Self::Suspended => {
                matches!(target, Self::Assigned | Self::Done | Self::Failed | Self::Cancelled)
            }
            Self::Retry => matches!(target, Self::Submitted | Self::Cancelled),
            Self::Done | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns all valid target states from the current state.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Initial => vec![Self::Submitted, Self::Cancelled],
            Self::Submitted => vec![Self::Assigned, Self::Done, Self::Failed, Self::Cancelled],
            Self::Assigned => vec![Self::Executing, Self::Retry, Self::Cancelled],
            Self::Executing => vec![
                Self::Done,
                Self::Failed,
                Self::Suspended,
                Self::Retry,
                Self::Cancelled,
            ],
            Self::Suspended => vec![Self::Assigned, Self::Done, Self::Failed, Self::Cancelled],
            Self::Retry => vec![Self::Submitted, Self::Cancelled],
            Self::Done | Self::Failed | Self::Cancelled => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Submitted => "submitted",
            Self::Assigned => "assigned",
            Self::Executing => "executing",
            Self::Suspended => "suspended",
            Self::Retry => "retry",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for SubmissionState {
    fn default() -> Self {
        Self::Initial
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "INITIAL"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Assigned => write!(f, "ASSIGNED"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Retry => write!(f, "RETRY"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Retention policy for a submission and its paired result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetentionPolicy {
    /// The pair is removed as soon as the submission reaches a terminal state.
    RemoveOnFinalState,
    /// The pair is removed only by an explicit discard.
    ExplicitRemove,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::ExplicitRemove
    }
}

/// Per-submission routing and delay options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionConfiguration {
    /// Colocation key: submissions sharing a group stick to one processor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_affinity: Option<String>,
    /// Attribute requirements a processor must satisfy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Delay before the submission becomes eligible for dispatch.
    #[serde(with = "humantime_serde", default)]
    pub submission_delay: Duration,
    /// Restrict dispatch to the named dispatcher, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatcher_filter: Option<String>,
}

impl SubmissionConfiguration {
    /// Creates a configuration with no delay, no affinity, and no requirements.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the group-affinity key.
    #[must_use]
    pub fn with_group_affinity(mut self, group: impl Into<String>) -> Self {
        self.group_affinity = Some(group.into());
        self
    }

    /// Adds an attribute requirement.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Sets the submission delay.
    #[must_use]
    pub const fn with_submission_delay(mut self, delay: Duration) -> Self {
        self.submission_delay = delay;
        self
    }

    /// Restricts dispatch to the named dispatcher.
    #[must_use]
    pub fn with_dispatcher_filter(mut self, name: impl Into<String>) -> Self {
        self.dispatcher_filter = Some(name.into());
        self
    }
}

/// Stable addressing for a submission plus its paired result record.
///
/// This is the unit exchanged between the dispatch controller, the
/// mediator's assignment queue, and the task processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionKeyPair {
    /// Key of the submission record.
    pub submission_id: SubmissionId,
    /// Key of the paired result record.
    pub result_id: ResultId,
}

impl SubmissionKeyPair {
    /// Creates a key pair.
    #[must_use]
    pub const fn new(submission_id: SubmissionId, result_id: ResultId) -> Self {
        Self {
            submission_id,
            result_id,
        }
    }
}

/// One unit of accepted work, tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Unique identifier.
    pub id: SubmissionId,
    /// Key of the paired result record.
    pub result_id: ResultId,
    /// Opaque work description.
    pub payload: Value,
    /// Routing and delay options.
    pub configuration: SubmissionConfiguration,
    /// Current lifecycle state.
    pub state: SubmissionState,
    /// When the submission was created.
    pub created_at: DateTime<Utc>,
    /// Owning processor, once assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<ProcessorId>,
    /// Reason for the most recent state transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<StateTransitionReason>,
    /// Timestamp of the most recent state transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// Creates a new submission in `Initial` state.
    #[must_use]
    pub fn new(payload: Value, configuration: SubmissionConfiguration) -> Self {
        Self::with_id(SubmissionId::generate(), payload, configuration)
    }

    /// Creates a new submission with a caller-chosen identifier.
    #[must_use]
    pub fn with_id(
        id: SubmissionId,
        payload: Value,
        configuration: SubmissionConfiguration,
    ) -> Self {
        Self {
            id,
            result_id: ResultId::generate(),
            payload,
            configuration,
            state: SubmissionState::Initial,
            created_at: Utc::now(),
            owner: None,
            last_transition_reason: None,
            last_transition_at: None,
        }
    }

    /// Returns the key pair addressing this submission and its result.
    #[must_use]
    pub const fn key_pair(&self) -> SubmissionKeyPair {
        SubmissionKeyPair::new(self.id, self.result_id)
    }

    /// Returns true if the submission is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions to a new state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(submission_id = %self.id, from = %self.state, to = %target)
    )]
    pub fn transition_to(&mut self, target: SubmissionState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.state,
                    self.state.valid_transitions()
                ),
            });
        }
        self.state = target;
        self.last_transition_at = Some(Utc::now());
        Ok(())
    }

    /// Transitions to a new state with an explicit reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn transition_to_with_reason(
        &mut self,
        target: SubmissionState,
        reason: StateTransitionReason,
    ) -> Result<()> {
        self.transition_to(target)?;
        self.last_transition_reason = Some(reason);
        Ok(())
    }
}

/// The mutable record paired 1:1 with a submission.
///
/// Holds the final or interim result value, the progress marker, and the
/// lifecycle timestamps. Listener registrations live engine-side, not in
/// this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    /// Key of this record.
    pub id: ResultId,
    /// The submission this record belongs to.
    pub submission_id: SubmissionId,
    /// Final or interim result value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Most recent progress marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    /// When the submission was accepted.
    pub submitted_at: DateTime<Utc>,
    /// When execution first started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_finished_at: Option<DateTime<Utc>>,
    /// How long the pair is retained.
    pub retention: RetentionPolicy,
}

impl SubmissionResult {
    /// Creates an empty result record for a submission.
    #[must_use]
    pub fn new(submission: &Submission, retention: RetentionPolicy) -> Self {
        Self {
            id: submission.result_id,
            submission_id: submission.id,
            value: None,
            progress: None,
            submitted_at: submission.created_at,
            execution_started_at: None,
            execution_finished_at: None,
            retention,
        }
    }

    /// Time between acceptance and the first execution start.
    #[must_use]
    pub fn wait_duration(&self) -> Option<Duration> {
        self.execution_started_at
            .map(|started| (started - self.submitted_at).to_std().unwrap_or_default())
    }

    /// Time between the first execution start and completion.
    #[must_use]
    pub fn execution_duration(&self) -> Option<Duration> {
        match (self.execution_started_at, self.execution_finished_at) {
            (Some(started), Some(finished)) => {
                Some((finished - started).to_std().unwrap_or_default())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn happy_path_transitions() {
        let mut s = Submission::new(json!({"n": 1}), SubmissionConfiguration::new());
        assert_eq!(s.state, SubmissionState::Initial);

        s.transition_to(SubmissionState::Submitted).unwrap();
        s.transition_to(SubmissionState::Assigned).unwrap();
        s.transition_to(SubmissionState::Executing).unwrap();
        s.transition_to(SubmissionState::Done).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [
            SubmissionState::Done,
            SubmissionState::Failed,
            SubmissionState::Cancelled,
        ] {
            assert!(terminal.valid_transitions().is_empty());
            assert!(!terminal.can_transition_to(SubmissionState::Submitted));
            assert!(!terminal.can_transition_to(SubmissionState::Cancelled));
        }
    }

    #[test]
    fn abort_finalizes_from_pending_states() {
        // A dispatch abort finalizes a submission that was never assigned.
        for pending in [SubmissionState::Submitted, SubmissionState::Suspended] {
            assert!(pending.can_transition_to(SubmissionState::Failed));
            assert!(pending.can_transition_to(SubmissionState::Done));
        }
        assert!(!SubmissionState::Initial.can_transition_to(SubmissionState::Failed));
    }

    #[test]
    fn cancel_legal_from_every_non_terminal_state() {
        for state in [
            SubmissionState::Initial,
            SubmissionState::Submitted,
            SubmissionState::Assigned,
            SubmissionState::Executing,
            SubmissionState::Suspended,
            SubmissionState::Retry,
        ] {
            assert!(
                state.can_transition_to(SubmissionState::Cancelled),
                "cancel should be legal from {state}"
            );
        }
    }

    #[test]
    fn suspend_and_resume_path() {
        let mut s = Submission::new(json!({}), SubmissionConfiguration::new());
        s.transition_to(SubmissionState::Submitted).unwrap();
        s.transition_to(SubmissionState::Assigned).unwrap();
        s.transition_to(SubmissionState::Executing).unwrap();
        s.transition_to_with_reason(SubmissionState::Suspended, StateTransitionReason::TaskYielded)
            .unwrap();
        assert_eq!(
            s.last_transition_reason,
            Some(StateTransitionReason::TaskYielded)
        );

        // Re-dispatch takes it back to ASSIGNED.
        s.transition_to(SubmissionState::Assigned).unwrap();
        s.transition_to(SubmissionState::Executing).unwrap();
        s.transition_to(SubmissionState::Done).unwrap();
    }

    #[test]
    fn retry_path_on_lease_expiry() {
        let mut s = Submission::new(json!({}), SubmissionConfiguration::new());
        s.transition_to(SubmissionState::Submitted).unwrap();
        s.transition_to(SubmissionState::Assigned).unwrap();
        s.transition_to_with_reason(SubmissionState::Retry, StateTransitionReason::LeaseExpired)
            .unwrap();
        s.transition_to_with_reason(
            SubmissionState::Submitted,
            StateTransitionReason::RetryRequeued,
        )
        .unwrap();
        assert_eq!(s.state, SubmissionState::Submitted);
    }

    #[test]
    fn invalid_transition_fails() {
        let mut s = Submission::new(json!({}), SubmissionConfiguration::new());
        let err = s.transition_to(SubmissionState::Executing).unwrap_err();
        assert!(err.to_string().contains("invalid state transition"));
        assert_eq!(s.state, SubmissionState::Initial);
    }

    #[test]
    fn result_durations() {
        let s = Submission::new(json!({}), SubmissionConfiguration::new());
        let mut result = SubmissionResult::new(&s, RetentionPolicy::ExplicitRemove);
        assert!(result.wait_duration().is_none());
        assert!(result.execution_duration().is_none());

        result.execution_started_at = Some(result.submitted_at + chrono::Duration::seconds(2));
        result.execution_finished_at = Some(result.submitted_at + chrono::Duration::seconds(5));
        assert_eq!(result.wait_duration(), Some(Duration::from_secs(2)));
        assert_eq!(result.execution_duration(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn configuration_builder() {
        let config = SubmissionConfiguration::new()
            .with_group_affinity("tenant-a")
            .with_attribute("zone", "eu-west")
            .with_submission_delay(Duration::from_millis(250))
            .with_dispatcher_filter("grid");

        assert_eq!(config.group_affinity.as_deref(), Some("tenant-a"));
        assert_eq!(config.attributes.get("zone").map(String::as_str), Some("eu-west"));
        assert_eq!(config.submission_delay, Duration::from_millis(250));
        assert_eq!(config.dispatcher_filter.as_deref(), Some("grid"));
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let json = serde_json::to_string(&SubmissionState::Executing).unwrap();
        assert_eq!(json, "\"EXECUTING\"");
    }
}
