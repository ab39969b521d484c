//! Resumable task abstraction and the execution environment handed to it.
//!
//! Tasks run to a [`TaskCompletion`]: either done with a value, or a
//! checkpoint-and-yield that releases the processor slot and schedules a
//! later resume. Yield is the cooperative suspension point; there is no
//! preemption.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use dray_core::SubmissionId;

use crate::error::{Error, Result};
use crate::events::{EventBus, SubmissionEvent, SubmissionEventKind};
use crate::store::SubmissionStore;

/// Payload field naming the task implementation to run.
pub const TASK_TYPE_FIELD: &str = "taskType";
/// Payload field carrying the task's input data.
pub const TASK_DATA_FIELD: &str = "data";

/// How a task run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCompletion {
    /// The task finished with a terminal value.
    Done(Value),
    /// The task checkpointed and wants to be resumed later.
    Yield {
        /// Opaque state persisted for the next run.
        checkpoint: Value,
        /// Minimum delay before the submission is re-offered for dispatch.
        resume_delay: Duration,
    },
}

/// A unit of work that can checkpoint and resume.
///
/// Implementations are registered in a [`TaskRegistry`] under a task type
/// name and resolved from submission payloads at execution time. A task
/// run either returns a completion or an error; panics are not part of
/// the contract.
#[async_trait]
pub trait ResumableTask: Send + Sync {
    /// Runs the task, fresh or resumed.
    ///
    /// A resumed run observes `env.is_resuming() == true` and the
    /// checkpoint persisted by the yielding run via `env.checkpoint()`.
    async fn run(&self, env: &mut ExecutionEnvironment) -> Result<TaskCompletion>;
}

impl std::fmt::Debug for dyn ResumableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResumableTask")
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("cancellation registry lock poisoned")
}

/// Shared set of submissions flagged for cooperative cancellation.
///
/// Cancellation is best-effort: marking a submission does not interrupt a
/// running task, it only flips the flag the task is expected to poll via
/// [`ExecutionEnvironment::is_cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    flagged: Arc<Mutex<HashSet<SubmissionId>>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags a submission for cancellation.
    pub fn mark(&self, id: SubmissionId) -> Result<()> {
        self.flagged.lock().map_err(poison_err)?.insert(id);
        Ok(())
    }

    /// Returns true if the submission has been flagged.
    pub fn is_marked(&self, id: &SubmissionId) -> Result<bool> {
        Ok(self.flagged.lock().map_err(poison_err)?.contains(id))
    }

    /// Clears the flag once the submission reached a terminal state.
    pub fn clear(&self, id: &SubmissionId) -> Result<()> {
        self.flagged.lock().map_err(poison_err)?.remove(id);
        Ok(())
    }
}

/// Execution-scoped view handed to a running task.
///
/// Carries the task's input data, the resume checkpoint if any, and the
/// channels for progress reporting and cancellation polling.
pub struct ExecutionEnvironment {
    submission_id: SubmissionId,
    data: Value,
    checkpoint: Option<Value>,
    is_resuming: bool,
    store: Arc<dyn SubmissionStore>,
    bus: EventBus,
    cancellation: CancellationRegistry,
}

impl ExecutionEnvironment {
    /// Creates the environment for one task run.
    #[must_use]
    pub fn new(
        submission_id: SubmissionId,
        data: Value,
        checkpoint: Option<Value>,
        store: Arc<dyn SubmissionStore>,
        bus: EventBus,
        cancellation: CancellationRegistry,
    ) -> Self {
        let is_resuming = checkpoint.is_some();
        Self {
            submission_id,
            data,
            checkpoint,
            is_resuming,
            store,
            bus,
            cancellation,
        }
    }

    /// The submission this run belongs to.
    #[must_use]
    pub const fn submission_id(&self) -> SubmissionId {
        self.submission_id
    }

    /// The task's input data from the submission payload.
    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.data
    }

    /// True when this run resumes a previously yielded execution.
    #[must_use]
    pub const fn is_resuming(&self) -> bool {
        self.is_resuming
    }

    /// The checkpoint persisted by the yielding run, if resuming.
    #[must_use]
    pub const fn checkpoint(&self) -> Option<&Value> {
        self.checkpoint.as_ref()
    }

    /// Records a progress marker on the paired result and notifies
    /// observers.
    pub async fn report_progress(&self, value: Value) -> Result<()> {
        let mut result = self
            .store
            .get_result(&self.submission_id)
            .await?
            .ok_or(Error::SubmissionNotFound {
                submission_id: self.submission_id,
            })?;
        result.progress = Some(value.clone());
        self.store.save_result(&result).await?;
        self.bus.publish(SubmissionEvent::new(
            self.submission_id,
            SubmissionEventKind::Progress { value },
        ));
        Ok(())
    }

    /// True if cancellation has been requested for this submission.
    ///
    /// Long-running tasks should poll this between work units and return
    /// early when it fires.
    pub fn is_cancelled(&self) -> Result<bool> {
        self.cancellation.is_marked(&self.submission_id)
    }
}

/// Maps task type names to implementations.
///
/// Submission payloads follow the `{"taskType": ..., "data": ...}`
/// convention; [`TaskRegistry::resolve`] splits a payload into the
/// registered implementation and its input data.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn ResumableTask>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task implementation under a type name, replacing any
    /// prior registration for that name.
    pub fn register(&mut self, task_type: impl Into<String>, task: Arc<dyn ResumableTask>) {
        self.tasks.insert(task_type.into(), task);
    }

    /// Returns the registered type names.
    #[must_use]
    pub fn task_types(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    /// Resolves a payload into its task implementation and input data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the payload lacks a string
    /// `taskType` field, and [`Error::UnknownTaskType`] if no
    /// implementation is registered for it.
    pub fn resolve(&self, payload: &Value) -> Result<(Arc<dyn ResumableTask>, Value)> {
        let task_type = payload
            .get(TASK_TYPE_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Serialization {
                message: format!("submission payload is missing a string `{TASK_TYPE_FIELD}` field"),
            })?;
        let task = self
            .tasks
            .get(task_type)
            .cloned()
            .ok_or_else(|| Error::UnknownTaskType {
                task_type: task_type.to_string(),
            })?;
        let data = payload.get(TASK_DATA_FIELD).cloned().unwrap_or(Value::Null);
        Ok((task, data))
    }
}

/// Builds a payload in the registry's `{"taskType", "data"}` convention.
#[must_use]
pub fn task_payload(task_type: &str, data: Value) -> Value {
    serde_json::json!({ TASK_TYPE_FIELD: task_type, TASK_DATA_FIELD: data })
}
