//! Dispatch straight to one in-process processor.

use async_trait::async_trait;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::Result;
use crate::pending::PendingSubmission;
use crate::processor::TaskProcessorDefinition;

/// Routes every matching submission to a single fixed processor.
///
/// The embedded deployment shape: one engine, one worker, no policy.
pub struct LocalExecutorDispatcher {
    definition: TaskProcessorDefinition,
}

impl LocalExecutorDispatcher {
    /// Creates a dispatcher targeting the given processor.
    #[must_use]
    pub fn new(definition: TaskProcessorDefinition) -> Self {
        Self { definition }
    }
}

#[async_trait]
impl Dispatcher for LocalExecutorDispatcher {
    fn name(&self) -> &str {
        "local"
    }

    async fn dispatch(&self, pending: &PendingSubmission) -> Result<DispatchOutcome> {
        if !self
            .definition
            .matches_attributes(&pending.configuration.attributes)
        {
            return Ok(DispatchOutcome::Rejected);
        }
        Ok(DispatchOutcome::Accepted {
            owner: self.definition.id,
        })
    }
}
