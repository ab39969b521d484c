//! Pass-through dispatcher that only logs what it sees.

use async_trait::async_trait;
use tracing::info;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::Result;
use crate::pending::PendingSubmission;

/// Logs every offered submission and rejects it.
///
/// Useful at the front of the dispatcher chain for tracing dispatch
/// traffic without affecting placement.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatcher;

impl LoggingDispatcher {
    /// Creates the dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dispatcher for LoggingDispatcher {
    fn name(&self) -> &str {
        "logging"
    }

    async fn dispatch(&self, pending: &PendingSubmission) -> Result<DispatchOutcome> {
        info!(
            submission_id = %pending.submission_id(),
            dispatch_state = %pending.dispatch_state,
            ready_at = %pending.ready_at,
            "submission offered for dispatch"
        );
        Ok(DispatchOutcome::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::{SubmissionConfiguration, SubmissionKeyPair};
    use chrono::Utc;
    use dray_core::{ResultId, SubmissionId};
    use serde_json::json;

    #[tokio::test]
    async fn always_rejects() {
        let dispatcher = LoggingDispatcher::new();
        let pending = PendingSubmission::new(
            SubmissionKeyPair::new(SubmissionId::generate(), ResultId::generate()),
            json!({}),
            SubmissionConfiguration::new(),
            Utc::now(),
        );
        assert_eq!(
            dispatcher.dispatch(&pending).await.unwrap(),
            DispatchOutcome::Rejected
        );
    }
}
