//! Dispatcher abstraction and dispatch outcomes.
//!
//! A dispatcher is offered pending submissions and answers with a
//! [`DispatchOutcome`]. Dispatchers never mutate submission state
//! themselves; the controller owns all store transitions so outcome
//! handling stays in one place.

pub mod local;
pub mod logging;
pub mod policy;
pub mod routed;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dray_core::ProcessorId;

use crate::error::Result;
use crate::pending::PendingSubmission;

/// Terminal result attached to an aborting dispatch decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum AbortResult {
    /// The submission is finalized as succeeded with this value.
    Success(Value),
    /// The submission is finalized as failed with this value.
    Failure(Value),
}

/// A dispatcher's answer to an offered submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The dispatcher routed the submission to a processor.
    Accepted {
        /// The processor now responsible for execution.
        owner: ProcessorId,
    },
    /// The dispatcher cannot handle the submission; offer it to the next one.
    Rejected,
    /// The dispatcher could handle the submission but not right now.
    RetryLater {
        /// Minimum delay before the submission is offered again.
        delay: Duration,
    },
    /// The submission must not be dispatched at all; finalize it now.
    Abort {
        /// Human-readable explanation recorded in logs.
        rationale: String,
        /// How the submission is finalized.
        result: AbortResult,
    },
}

impl DispatchOutcome {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Rejected => "rejected",
            Self::RetryLater { .. } => "retry_later",
            Self::Abort { .. } => "abort",
        }
    }
}

/// Routes pending submissions to processors.
///
/// The controller offers each ready submission to registered dispatchers
/// in registration order until one accepts or aborts it. A dispatcher
/// error is logged and treated as a rejection so one faulty dispatcher
/// cannot wedge the chain.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Stable name used for logging and per-submission dispatcher filters.
    fn name(&self) -> &str;

    /// Decides what to do with a pending submission.
    ///
    /// Must not touch the store; on acceptance the controller commits
    /// the state transition, the owner, and the assignment queue entry,
    /// so a processor never drains work that is not yet committed.
    async fn dispatch(&self, pending: &PendingSubmission) -> Result<DispatchOutcome>;
}
