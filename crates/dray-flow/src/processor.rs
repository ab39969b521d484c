//! Task processors: the worker side of the engine.
//!
//! A processor owns an assignment queue in the store, executes assigned
//! submissions under a bounded permit pool, heartbeats its lease, and
//! republishes yielded work for later resume. Execution failures are
//! absorbed into terminal submission states; a processor never stalls on
//! a bad task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use dray_core::ProcessorId;

use crate::controller::DispatchController;
use crate::error::{Error, Result};
use crate::events::{EventBus, SubmissionEvent, SubmissionEventKind};
use crate::expiry::{LeaseExpiryCoordinator, LeaseListener};
use crate::lease::{Lease, SharedLease};
use crate::metrics::EngineMetrics;
use crate::pending::PendingSubmission;
use crate::store::{StoreEvent, SubmissionStore};
use crate::submission::{
    RetentionPolicy, StateTransitionReason, Submission, SubmissionKeyPair, SubmissionState,
};
use crate::task::{CancellationRegistry, ExecutionEnvironment, TaskCompletion, TaskRegistry};

/// Execution shape of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Executes up to `threads` submissions concurrently.
    Grid {
        /// Concurrent execution slots.
        threads: usize,
    },
    /// Executes one submission at a time.
    Single,
}

impl ProcessorKind {
    /// Number of concurrent execution permits this kind grants.
    #[must_use]
    pub const fn permits(&self) -> usize {
        match self {
            Self::Grid { threads } => {
                if *threads == 0 {
                    1
                } else {
                    *threads
                }
            }
            Self::Single => 1,
        }
    }
}

/// Identity and routing surface of a processor.
#[derive(Debug, Clone)]
pub struct TaskProcessorDefinition {
    /// Stable processor identifier.
    pub id: ProcessorId,
    /// Human-readable name for logs.
    pub name: String,
    /// Execution shape.
    pub kind: ProcessorKind,
    /// Capability attributes matched against submission requirements.
    pub attributes: BTreeMap<String, String>,
}

impl TaskProcessorDefinition {
    /// Creates a definition with no attributes.
    #[must_use]
    pub fn new(id: ProcessorId, name: impl Into<String>, kind: ProcessorKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a capability attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Returns true if this processor's attributes satisfy every required
    /// attribute.
    #[must_use]
    pub fn matches_attributes(&self, required: &BTreeMap<String, String>) -> bool {
        required
            .iter()
            .all(|(key, value)| self.attributes.get(key) == Some(value))
    }
}

/// Processor liveness tuning.
#[derive(Debug, Clone, Copy)]
pub struct TaskProcessorConfig {
    /// Lease validity window granted per heartbeat.
    pub lease_duration: Duration,
    /// Interval between lease extensions.
    pub heartbeat_interval: Duration,
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

impl TaskProcessorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lease validity window.
    #[must_use]
    pub const fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Executes submissions assigned to it by the dispatch subsystem.
pub struct TaskProcessor {
    definition: TaskProcessorDefinition,
    config: TaskProcessorConfig,
    store: Arc<dyn SubmissionStore>,
    bus: EventBus,
    registry: Arc<TaskRegistry>,
    controller: Arc<DispatchController>,
    cancellation: CancellationRegistry,
    lease: SharedLease,
    permits: Arc<Semaphore>,
    expiry_watch: Option<(Arc<LeaseExpiryCoordinator>, Arc<dyn LeaseListener>)>,
    metrics: EngineMetrics,
}

impl TaskProcessor {
    /// Creates a processor with a freshly acquired lease.
    #[must_use]
    pub fn new(
        definition: TaskProcessorDefinition,
        config: TaskProcessorConfig,
        store: Arc<dyn SubmissionStore>,
        bus: EventBus,
        registry: Arc<TaskRegistry>,
        controller: Arc<DispatchController>,
        cancellation: CancellationRegistry,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(definition.kind.permits()));
        let lease = SharedLease::new(Lease::acquired(config.lease_duration, Utc::now()));
        Self {
            definition,
            config,
            store,
            bus,
            registry,
            controller,
            cancellation,
            lease,
            permits,
            expiry_watch: None,
            metrics: EngineMetrics::new(),
        }
    }

    /// Attaches the expiry coordinator and recovery listener so the
    /// heartbeat can re-register the lease watch.
    ///
    /// A fired watch is dropped by the coordinator; a processor that is in
    /// fact still alive restores it on its next successful renewal.
    #[must_use]
    pub fn with_expiry_watch(
        mut self,
        coordinator: Arc<LeaseExpiryCoordinator>,
        listener: Arc<dyn LeaseListener>,
    ) -> Self {
        self.expiry_watch = Some((coordinator, listener));
        self
    }

    /// Returns the processor identifier.
    #[must_use]
    pub const fn id(&self) -> ProcessorId {
        self.definition.id
    }

    /// Returns the routing definition.
    #[must_use]
    pub fn definition(&self) -> &TaskProcessorDefinition {
        &self.definition
    }

    /// Returns a handle to the processor's lease, for expiry watching.
    #[must_use]
    pub fn lease(&self) -> SharedLease {
        self.lease.clone()
    }

    /// Spawns the work loop and the heartbeat loop.
    ///
    /// The work loop first drains any assignments left over from a prior
    /// incarnation, then reacts to queue notifications. Handles are
    /// aborted on engine shutdown.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let me = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(me.config.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if me
                    .lease
                    .extend(me.config.lease_duration, Utc::now())
                    .is_err()
                {
                    debug!(processor_id = %me.id(), "lease no longer extendable, stopping heartbeat");
                    break;
                }
                if let Err(error) = me.restore_expiry_watch() {
                    warn!(processor_id = %me.id(), %error, "lease watch restore failed");
                }
            }
        }));

        let me = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            let mut events = me.store.subscribe();
            // Startup recovery: execute whatever the queue already holds.
            if let Err(error) = me.drain_and_execute().await {
                warn!(processor_id = %me.id(), %error, "startup drain failed");
            }
            loop {
                match events.recv().await {
                    Ok(StoreEvent::AssignmentQueued { processor_id })
                        if processor_id == me.id() =>
                    {
                        if let Err(error) = me.drain_and_execute().await {
                            warn!(processor_id = %me.id(), %error, "assignment drain failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Notifications were dropped; the queue itself is
                        // authoritative, so drain unconditionally.
                        debug!(processor_id = %me.id(), missed, "store events lagged");
                        if let Err(error) = me.drain_and_execute().await {
                            warn!(processor_id = %me.id(), %error, "catch-up drain failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        handles
    }

    /// Re-registers the lease watch if the coordinator dropped it.
    ///
    /// Runs after each successful renewal, so a watch lost to a spurious
    /// expiry does not leave the processor unmonitored.
    fn restore_expiry_watch(&self) -> Result<()> {
        let Some((coordinator, listener)) = &self.expiry_watch else {
            return Ok(());
        };
        if !coordinator.is_watching(&self.definition.id)? {
            warn!(processor_id = %self.id(), "lease watch missing, re-registering");
            coordinator.register(self.definition.id, self.lease.clone(), Arc::clone(listener))?;
        }
        Ok(())
    }

    /// Drains the assignment queue and executes each entry under a permit.
    async fn drain_and_execute(self: &Arc<Self>) -> Result<()> {
        for key in self.store.drain_assignments(&self.definition.id).await? {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::ShutDown)?;
            let me = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                let submission_id = key.submission_id;
                if let Err(error) = me.execute_assignment(key).await {
                    warn!(
                        processor_id = %me.id(),
                        %submission_id,
                        %error,
                        "assignment execution failed"
                    );
                }
            });
        }
        Ok(())
    }

    /// Runs one assigned submission to a terminal or suspended state.
    ///
    /// Stale assignments (submission gone, reassigned, or no longer
    /// `ASSIGNED`) are skipped silently; the CAS to `EXECUTING` is the
    /// authoritative claim.
    #[tracing::instrument(skip(self, key), fields(processor_id = %self.id(), submission_id = %key.submission_id))]
    pub async fn execute_assignment(&self, key: SubmissionKeyPair) -> Result<()> {
        let submission_id = key.submission_id;
        let Some(submission) = self.store.get_submission(&submission_id).await? else {
            return Ok(());
        };
        if submission.state != SubmissionState::Assigned
            || submission.owner != Some(self.definition.id)
        {
            debug!(state = %submission.state, "skipping stale assignment");
            return Ok(());
        }
        let cas = self
            .store
            .cas_submission_state(
                &submission_id,
                SubmissionState::Assigned,
                SubmissionState::Executing,
                StateTransitionReason::ExecutionStarted,
            )
            .await?;
        if !cas.is_success() {
            debug!(?cas, "lost the claim race, skipping");
            return Ok(());
        }

        if let Some(mut record) = self.store.get_result(&submission_id).await? {
            if record.execution_started_at.is_none() {
                record.execution_started_at = Some(Utc::now());
                self.store.save_result(&record).await?;
            }
        }
        self.bus
            .publish(SubmissionEvent::new(submission_id, SubmissionEventKind::Started));

        let (task, data) = match self.registry.resolve(&submission.payload) {
            Ok(resolved) => resolved,
            Err(error) => {
                return self
                    .finalize(&submission, json!({ "error": error.to_string() }), false)
                    .await;
            }
        };
        let checkpoint = self.store.load_checkpoint(&submission_id).await?;
        let mut env = ExecutionEnvironment::new(
            submission_id,
            data,
            checkpoint,
            Arc::clone(&self.store),
            self.bus.clone(),
            self.cancellation.clone(),
        );

        let started = Instant::now();
        match task.run(&mut env).await {
            Ok(TaskCompletion::Done(value)) => {
                self.metrics.observe_task_duration("done", started.elapsed());
                self.store.remove_checkpoint(&submission_id).await?;
                self.finalize(&submission, value, true).await
            }
            Ok(TaskCompletion::Yield {
                checkpoint,
                resume_delay,
            }) => {
                self.metrics
                    .observe_task_duration("suspended", started.elapsed());
                self.suspend(&submission, key, checkpoint, resume_delay).await
            }
            Err(error) => {
                self.metrics.observe_task_duration("failed", started.elapsed());
                self.finalize(&submission, json!({ "error": error.to_string() }), false)
                    .await
            }
        }
    }

    /// Persists a checkpoint, suspends the submission, and schedules the
    /// resume offer.
    async fn suspend(
        &self,
        submission: &Submission,
        key: SubmissionKeyPair,
        checkpoint: Value,
        resume_delay: Duration,
    ) -> Result<()> {
        let submission_id = submission.id;
        self.store.save_checkpoint(&submission_id, &checkpoint).await?;
        let cas = self
            .store
            .cas_submission_state(
                &submission_id,
                SubmissionState::Executing,
                SubmissionState::Suspended,
                StateTransitionReason::TaskYielded,
            )
            .await?;
        if !cas.is_success() {
            debug!(?cas, "suspend superseded");
            return Ok(());
        }
        self.store.set_owner(&submission_id, None).await?;
        self.bus
            .publish(SubmissionEvent::new(submission_id, SubmissionEventKind::Suspended));
        self.controller.accept(PendingSubmission::resume(
            key,
            submission.payload.clone(),
            submission.configuration.clone(),
            resume_delay,
            Utc::now(),
        ))
    }

    /// Records the terminal value and transitions to `DONE` or `FAILED`.
    async fn finalize(&self, submission: &Submission, value: Value, success: bool) -> Result<()> {
        let submission_id = submission.id;
        let (target, reason, kind) = if success {
            (
                SubmissionState::Done,
                StateTransitionReason::ExecutionSucceeded,
                SubmissionEventKind::Done {
                    result: value.clone(),
                },
            )
        } else {
            (
                SubmissionState::Failed,
                StateTransitionReason::ExecutionFailed,
                SubmissionEventKind::Failed {
                    result: value.clone(),
                },
            )
        };

        // The value is written before the CAS so a waiter observing the
        // terminal state always finds it; losing the CAS restores the
        // record below.
        let mut retention = RetentionPolicy::ExplicitRemove;
        let mut prior = None;
        if let Some(record) = self.store.get_result(&submission_id).await? {
            prior = Some(record.clone());
            let mut updated = record;
            updated.value = Some(value);
            updated.execution_finished_at = Some(Utc::now());
            retention = updated.retention;
            self.store.save_result(&updated).await?;
        }

        let cas = self
            .store
            .cas_submission_state(&submission_id, SubmissionState::Executing, target, reason)
            .await?;
        if !cas.is_success() {
            // Typically cancelled mid-run; the terminal state stands, and
            // the cancelled record must not keep this run's value.
            if let Some(prior) = prior {
                self.store.save_result(&prior).await?;
            }
            debug!(?cas, "finalization superseded");
            return Ok(());
        }
        self.metrics.record_transition(target.as_label());
        self.bus.publish(SubmissionEvent::new(submission_id, kind));
        self.cancellation.clear(&submission_id)?;
        if retention == RetentionPolicy::RemoveOnFinalState {
            self.store.remove_pair(&submission_id).await?;
        }
        Ok(())
    }
}

/// Requeues submissions orphaned by an expired processor lease.
pub struct WorkRecoveryListener {
    store: Arc<dyn SubmissionStore>,
    controller: Arc<DispatchController>,
    metrics: EngineMetrics,
}

impl WorkRecoveryListener {
    /// Creates a listener recovering into the given controller.
    #[must_use]
    pub fn new(store: Arc<dyn SubmissionStore>, controller: Arc<DispatchController>) -> Self {
        Self {
            store,
            controller,
            metrics: EngineMetrics::new(),
        }
    }

    /// Moves every submission owned by the processor through `RETRY` back
    /// to `SUBMITTED` and re-enqueues it as fresh pending work.
    ///
    /// Each requeue is CAS-guarded; a submission concurrently finished or
    /// cancelled is left alone.
    pub async fn recover_owned(&self, processor: ProcessorId) -> Result<usize> {
        let mut recovered = 0;
        for submission in self.store.submissions_owned_by(&processor).await? {
            let submission_id = submission.id;
            let cas = self
                .store
                .cas_submission_state(
                    &submission_id,
                    submission.state,
                    SubmissionState::Retry,
                    StateTransitionReason::LeaseExpired,
                )
                .await?;
            if !cas.is_success() {
                debug!(%submission_id, ?cas, "skipping concurrently settled submission");
                continue;
            }
            self.store
                .cas_submission_state(
                    &submission_id,
                    SubmissionState::Retry,
                    SubmissionState::Submitted,
                    StateTransitionReason::RetryRequeued,
                )
                .await?;
            self.store.set_owner(&submission_id, None).await?;
            self.metrics.record_retry("lease_expired");
            self.controller.accept(PendingSubmission::new(
                submission.key_pair(),
                submission.payload.clone(),
                submission.configuration.clone(),
                Utc::now(),
            ))?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(processor_id = %processor, recovered, "requeued orphaned submissions");
        }
        Ok(recovered)
    }
}

impl LeaseListener for WorkRecoveryListener {
    fn on_lease_expiry(&self, processor: &ProcessorId) {
        let store = Arc::clone(&self.store);
        let controller = Arc::clone(&self.controller);
        let metrics = self.metrics.clone();
        let processor = *processor;
        tokio::spawn(async move {
            let listener = WorkRecoveryListener {
                store,
                controller,
                metrics,
            };
            if let Err(error) = listener.recover_owned(processor).await {
                warn!(processor_id = %processor, %error, "work recovery failed");
            }
        });
    }
}
