//! Submission lifecycle events and listener dispatch.
//!
//! Events are an explicit tagged enum routed to listener callbacks through
//! a statically-built dispatch table ([`deliver`]) resolved at compile
//! time; there is no runtime introspection. Delivery is at-least-once per
//! actual transition, in transition order, per submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use dray_core::SubmissionId;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SubmissionEventKind {
    /// Execution started (also fired when a resumed execution starts).
    Started,
    /// The task reported a progress marker.
    Progress {
        /// The reported marker.
        value: Value,
    },
    /// The task checkpointed and yielded.
    Suspended,
    /// The submission completed successfully.
    Done {
        /// The terminal result value.
        result: Value,
    },
    /// The submission failed.
    Failed {
        /// The captured failure cause.
        result: Value,
    },
    /// The submission was cancelled.
    ///
    /// The listener vocabulary has no dedicated cancellation callback;
    /// [`deliver`] routes this to `on_failed` with the cancellation result.
    Cancelled {
        /// The result value recorded at cancellation, usually null.
        result: Value,
    },
}

impl SubmissionEventKind {
    /// Returns true if this event ends the submission's lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. } | Self::Cancelled { .. })
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress { .. } => "progress",
            Self::Suspended => "suspended",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// A submission lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEvent {
    /// The submission the event belongs to.
    pub submission_id: SubmissionId,
    /// What happened.
    #[serde(flatten)]
    pub kind: SubmissionEventKind,
    /// When the event was published.
    pub at: DateTime<Utc>,
}

impl SubmissionEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(submission_id: SubmissionId, kind: SubmissionEventKind) -> Self {
        Self {
            submission_id,
            kind,
            at: Utc::now(),
        }
    }
}

/// Callbacks observing one submission's lifecycle.
///
/// Callbacks are invoked at-least-once per actual transition, in transition
/// order. Implementations must be fast and non-blocking; long work should
/// hand off asynchronously.
pub trait SubmissionOutcomeListener: Send + Sync {
    /// Execution started.
    fn on_started(&self) {}
    /// The task reported progress.
    fn on_progress(&self, value: &Value) {
        let _ = value;
    }
    /// The task checkpointed and yielded.
    fn on_suspended(&self) {}
    /// The submission completed successfully.
    fn on_done(&self, result: &Value) {
        let _ = result;
    }
    /// The submission failed (or was cancelled; see [`deliver`]).
    fn on_failed(&self, result: &Value) {
        let _ = result;
    }
}

/// Routes an event to the matching listener callback.
///
/// This is the engine's only event-to-handler mapping: an exhaustive match
/// over the tagged variants, fixed at compile time.
pub fn deliver(listener: &dyn SubmissionOutcomeListener, event: &SubmissionEvent) {
    match &event.kind {
        SubmissionEventKind::Started => listener.on_started(),
        SubmissionEventKind::Progress { value } => listener.on_progress(value),
        SubmissionEventKind::Suspended => listener.on_suspended(),
        SubmissionEventKind::Done { result } => listener.on_done(result),
        SubmissionEventKind::Failed { result } | SubmissionEventKind::Cancelled { result } => {
            listener.on_failed(result);
        }
    }
}

/// Broadcast bus carrying submission events to outcome handles and
/// listener delivery tasks.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SubmissionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Publishing with no subscribers is a no-op.
    pub fn publish(&self, event: SubmissionEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribes to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SubmissionEvent> {
        self.sender.subscribe()
    }
}
