//! Engine composition root and the client-facing session API.
//!
//! [`ProcessingEngine`] wires the store, dispatch controller, lease
//! expiry coordinator, and processors together and owns their background
//! tasks. [`ProcessingSession`] is the cheap, cloneable client handle for
//! submitting and managing work; [`SubmissionOutcome`] is the per-
//! submission handle for awaiting and inspecting results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use dray_core::SubmissionId;

use crate::controller::{DispatchController, DispatchControllerConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::events::{deliver, EventBus, SubmissionEvent, SubmissionEventKind, SubmissionOutcomeListener};
use crate::expiry::{LeaseExpiryCoordinator, LeaseListener};
use crate::metrics::EngineMetrics;
use crate::pending::PendingSubmission;
use crate::processor::{TaskProcessor, TaskProcessorConfig, TaskProcessorDefinition, WorkRecoveryListener};
use crate::store::SubmissionStore;
use crate::submission::{
    RetentionPolicy, StateTransitionReason, Submission, SubmissionConfiguration, SubmissionResult,
    SubmissionState,
};
use crate::task::{CancellationRegistry, TaskRegistry};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("engine handle table lock poisoned")
}

/// Engine-level tuning.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Dispatch controller configuration.
    pub controller: DispatchControllerConfig,
    /// Interval between lease expiry sweeps.
    pub lease_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller: DispatchControllerConfig::default(),
            lease_sweep_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dispatch controller configuration.
    #[must_use]
    pub const fn with_controller(mut self, controller: DispatchControllerConfig) -> Self {
        self.controller = controller;
        self
    }

    /// Sets the lease sweep interval.
    #[must_use]
    pub const fn with_lease_sweep_interval(mut self, interval: Duration) -> Self {
        self.lease_sweep_interval = interval;
        self
    }
}

/// Owns the engine's shared components and background tasks.
pub struct ProcessingEngine {
    store: Arc<dyn SubmissionStore>,
    bus: EventBus,
    registry: Arc<TaskRegistry>,
    controller: Arc<DispatchController>,
    coordinator: Arc<LeaseExpiryCoordinator>,
    cancellation: CancellationRegistry,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
    metrics: EngineMetrics,
}

impl ProcessingEngine {
    /// Starts an engine: spawns the dispatch loop and the lease sweep loop.
    #[must_use]
    pub fn start(
        store: Arc<dyn SubmissionStore>,
        registry: Arc<TaskRegistry>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let controller = Arc::new(DispatchController::new(
            Arc::clone(&store),
            bus.clone(),
            config.controller,
        ));
        let coordinator = Arc::new(LeaseExpiryCoordinator::new());

        let engine = Arc::new(Self {
            store,
            bus,
            registry,
            controller: Arc::clone(&controller),
            coordinator: Arc::clone(&coordinator),
            cancellation: CancellationRegistry::new(),
            handles: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            metrics: EngineMetrics::new(),
        });

        let mut handles = vec![
            controller.spawn(),
            coordinator.spawn(config.lease_sweep_interval),
        ];
        if let Ok(mut table) = engine.handles.lock() {
            table.append(&mut handles);
        }
        engine
    }

    /// Registers a dispatcher at the end of the offer chain.
    pub fn register_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
        self.ensure_running()?;
        self.controller.register_dispatcher(dispatcher)
    }

    /// Starts a processor: spawns its loops and watches its lease, with
    /// work recovery wired to the dispatch controller.
    pub fn start_processor(
        &self,
        definition: TaskProcessorDefinition,
        config: TaskProcessorConfig,
    ) -> Result<Arc<TaskProcessor>> {
        self.ensure_running()?;
        let recovery: Arc<dyn LeaseListener> = Arc::new(WorkRecoveryListener::new(
            Arc::clone(&self.store),
            Arc::clone(&self.controller),
        ));
        let processor = Arc::new(
            TaskProcessor::new(
                definition,
                config,
                Arc::clone(&self.store),
                self.bus.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.controller),
                self.cancellation.clone(),
            )
            .with_expiry_watch(Arc::clone(&self.coordinator), Arc::clone(&recovery)),
        );
        self.coordinator
            .register(processor.id(), processor.lease(), recovery)?;
        let mut spawned = Arc::clone(&processor).spawn();
        self.handles.lock().map_err(poison_err)?.append(&mut spawned);
        Ok(processor)
    }

    /// Returns a client session handle.
    #[must_use]
    pub fn session(self: &Arc<Self>) -> ProcessingSession {
        ProcessingSession {
            engine: Arc::clone(self),
        }
    }

    /// Returns the dispatch controller, for dispatchers needing direct
    /// capacity-update signalling.
    #[must_use]
    pub fn controller(&self) -> Arc<DispatchController> {
        Arc::clone(&self.controller)
    }

    /// Returns the lease expiry coordinator, for watching externally
    /// managed leases.
    #[must_use]
    pub fn coordinator(&self) -> Arc<LeaseExpiryCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Stops all background tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        debug!("engine shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }
}

impl Drop for ProcessingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client handle for submitting and managing work.
#[derive(Clone)]
pub struct ProcessingSession {
    engine: Arc<ProcessingEngine>,
}

impl ProcessingSession {
    /// Submits a payload with a generated identifier and default retention.
    pub async fn submit(
        &self,
        payload: Value,
        configuration: SubmissionConfiguration,
    ) -> Result<SubmissionOutcome> {
        self.submit_as(
            SubmissionId::generate(),
            payload,
            configuration,
            RetentionPolicy::ExplicitRemove,
            None,
        )
        .await
    }

    /// Submits a payload with a lifecycle listener attached.
    pub async fn submit_with_listener(
        &self,
        payload: Value,
        configuration: SubmissionConfiguration,
        listener: Arc<dyn SubmissionOutcomeListener>,
    ) -> Result<SubmissionOutcome> {
        self.submit_as(
            SubmissionId::generate(),
            payload,
            configuration,
            RetentionPolicy::ExplicitRemove,
            Some(listener),
        )
        .await
    }

    /// Submits a payload under a caller-chosen identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSubmission`] if the identifier is already
    /// in use.
    pub async fn submit_as(
        &self,
        id: SubmissionId,
        payload: Value,
        configuration: SubmissionConfiguration,
        retention: RetentionPolicy,
        listener: Option<Arc<dyn SubmissionOutcomeListener>>,
    ) -> Result<SubmissionOutcome> {
        self.engine.ensure_running()?;
        let mut submission = Submission::with_id(id, payload, configuration);
        submission.transition_to_with_reason(
            SubmissionState::Submitted,
            StateTransitionReason::SubmissionAccepted,
        )?;
        let result = SubmissionResult::new(&submission, retention);

        // Subscribe before the pair becomes dispatchable so no transition
        // can be missed. The listener task is only spawned once the
        // identifier is known to be ours; a duplicate submission must not
        // leave a listener attached to someone else's lifecycle.
        let outcome = self.outcome_for(id);
        let listener_events = listener.as_ref().map(|_| self.engine.bus.subscribe());

        let cas = self.engine.store.put_pair_if_absent(&submission, &result).await?;
        if !cas.is_success() {
            return Err(Error::DuplicateSubmission { submission_id: id });
        }
        self.engine.metrics.record_transition("submitted");
        if let (Some(listener), Some(events)) = (listener, listener_events) {
            self.spawn_listener(id, listener, events);
        }

        self.engine
            .controller
            .accept(PendingSubmission::for_submission(&submission))?;
        Ok(outcome)
    }

    /// Re-attaches to an existing submission.
    ///
    /// The requested retention policy is applied to the stored result
    /// record, so a re-attaching client can change how the pair is kept
    /// after the final state.
    pub async fn acquire_submission(
        &self,
        id: SubmissionId,
        retention: RetentionPolicy,
        listener: Option<Arc<dyn SubmissionOutcomeListener>>,
    ) -> Result<SubmissionOutcome> {
        self.engine.ensure_running()?;
        if self.engine.store.get_submission(&id).await?.is_none() {
            return Err(Error::SubmissionNotFound { submission_id: id });
        }
        if let Some(mut record) = self.engine.store.get_result(&id).await? {
            if record.retention != retention {
                record.retention = retention;
                self.engine.store.save_result(&record).await?;
            }
        }
        let outcome = self.outcome_for(id);
        if let Some(listener) = listener {
            self.spawn_listener(id, listener, self.engine.bus.subscribe());
        }
        Ok(outcome)
    }

    /// Removes a submission and its result from the engine.
    ///
    /// Pending dispatch entries are discarded first. Returns true if a
    /// stored pair was removed.
    pub async fn discard_submission(&self, id: SubmissionId) -> Result<bool> {
        self.engine.controller.discard(&id)?;
        self.engine.cancellation.clear(&id)?;
        self.engine.store.remove_pair(&id).await
    }

    /// Releases a client's interest in an outcome without affecting the
    /// submission itself.
    pub fn release_submission(&self, outcome: SubmissionOutcome) {
        drop(outcome);
    }

    /// Cancels a submission from any non-terminal state.
    ///
    /// Returns once the state is durably `CANCELLED`; an in-progress task
    /// is signalled cooperatively but not forcibly interrupted. Returns
    /// false if the submission is unknown or already terminal.
    pub async fn cancel_submission(&self, id: SubmissionId) -> Result<bool> {
        loop {
            let Some(submission) = self.engine.store.get_submission(&id).await? else {
                return Ok(false);
            };
            if submission.state.is_terminal() {
                return Ok(false);
            }
            let cas = self
                .engine
                .store
                .cas_submission_state(
                    &id,
                    submission.state,
                    SubmissionState::Cancelled,
                    StateTransitionReason::UserCancelled,
                )
                .await?;
            if !cas.is_success() {
                // Raced with another transition; re-read and retry.
                continue;
            }

            self.engine.cancellation.mark(id)?;
            self.engine.controller.discard(&id)?;
            self.engine.metrics.record_transition("cancelled");

            let mut retention = RetentionPolicy::ExplicitRemove;
            if let Some(mut record) = self.engine.store.get_result(&id).await? {
                record.execution_finished_at = Some(Utc::now());
                retention = record.retention;
                self.engine.store.save_result(&record).await?;
            }
            self.engine.bus.publish(SubmissionEvent::new(
                id,
                SubmissionEventKind::Cancelled {
                    result: Value::Null,
                },
            ));
            if retention == RetentionPolicy::RemoveOnFinalState {
                self.engine.store.remove_pair(&id).await?;
            }
            return Ok(true);
        }
    }

    /// Returns true if a submission with the identifier exists.
    pub async fn submission_exists(&self, id: SubmissionId) -> Result<bool> {
        Ok(self.engine.store.get_submission(&id).await?.is_some())
    }

    /// Lists all known submission identifiers.
    pub async fn identifiers(&self) -> Result<Vec<SubmissionId>> {
        self.engine.store.submission_ids().await
    }

    /// Shuts the engine down.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    fn outcome_for(&self, id: SubmissionId) -> SubmissionOutcome {
        SubmissionOutcome {
            submission_id: id,
            store: Arc::clone(&self.engine.store),
            events: self.engine.bus.subscribe(),
        }
    }

    /// Forwards bus events for one submission to a listener until a
    /// terminal event is delivered.
    ///
    /// The receiver is subscribed by the caller so it can predate the
    /// submission becoming visible.
    fn spawn_listener(
        &self,
        id: SubmissionId,
        listener: Arc<dyn SubmissionOutcomeListener>,
        mut events: broadcast::Receiver<SubmissionEvent>,
    ) {
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.submission_id == id => {
                        let terminal = event.kind.is_terminal();
                        deliver(listener.as_ref(), &event);
                        if terminal {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(submission_id = %id, missed, "listener missed events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Ok(mut handles) = self.engine.handles.lock() {
            handles.push(handle);
        }
    }
}

/// Per-submission handle for awaiting and inspecting the result.
pub struct SubmissionOutcome {
    submission_id: SubmissionId,
    store: Arc<dyn SubmissionStore>,
    events: broadcast::Receiver<SubmissionEvent>,
}

impl std::fmt::Debug for SubmissionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionOutcome")
            .field("submission_id", &self.submission_id)
            .finish_non_exhaustive()
    }
}

impl SubmissionOutcome {
    /// Waits until the submission reaches a terminal state.
    ///
    /// Returns the result value on `DONE`; failure and cancellation
    /// surface as [`Error::ExecutionFailed`] and
    /// [`Error::SubmissionCancelled`].
    pub async fn get(&mut self) -> Result<Value> {
        // One store re-check up front tolerates events published before
        // this handle started listening.
        if let Some(outcome) = self.terminal_from_store().await? {
            return outcome;
        }
        loop {
            match self.events.recv().await {
                Ok(event) if event.submission_id == self.submission_id => {
                    if let Some(outcome) = self.map_terminal(&event.kind) {
                        return outcome;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(outcome) = self.terminal_from_store().await? {
                        return outcome;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ShutDown),
            }
        }
    }

    /// Waits like [`SubmissionOutcome::get`], bounded by `timeout`.
    ///
    /// On timeout the store is re-checked once to tolerate missed change
    /// notifications before [`Error::OutcomeTimeout`] is returned.
    pub async fn get_timeout(&mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if let Some(outcome) = self.terminal_from_store().await? {
                    return outcome;
                }
                Err(Error::OutcomeTimeout {
                    submission_id: self.submission_id,
                    waited: timeout,
                })
            }
        }
    }

    /// The latest progress marker reported by the task.
    pub async fn progress(&self) -> Result<Option<Value>> {
        Ok(self
            .store
            .get_result(&self.submission_id)
            .await?
            .and_then(|record| record.progress))
    }

    /// The submission's current state, if it still exists.
    pub async fn submission_state(&self) -> Result<Option<SubmissionState>> {
        Ok(self
            .store
            .get_submission(&self.submission_id)
            .await?
            .map(|submission| submission.state))
    }

    /// When the submission was accepted.
    pub async fn submission_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get_result(&self.submission_id)
            .await?
            .map(|record| record.submitted_at))
    }

    /// Time spent waiting before execution first started.
    pub async fn wait_duration(&self) -> Result<Option<Duration>> {
        Ok(self
            .store
            .get_result(&self.submission_id)
            .await?
            .and_then(|record| record.wait_duration()))
    }

    /// Time between first execution start and completion.
    pub async fn execution_duration(&self) -> Result<Option<Duration>> {
        Ok(self
            .store
            .get_result(&self.submission_id)
            .await?
            .and_then(|record| record.execution_duration()))
    }

    /// True if the submission reached a terminal state.
    pub async fn is_final_state(&self) -> Result<bool> {
        Ok(self
            .submission_state()
            .await?
            .is_some_and(|state| state.is_terminal()))
    }

    /// The submission identifier.
    #[must_use]
    pub const fn identifier(&self) -> SubmissionId {
        self.submission_id
    }

    /// The retention policy on the paired result record.
    pub async fn retention_policy(&self) -> Result<Option<RetentionPolicy>> {
        Ok(self
            .store
            .get_result(&self.submission_id)
            .await?
            .map(|record| record.retention))
    }

    fn map_terminal(&self, kind: &SubmissionEventKind) -> Option<Result<Value>> {
        match kind {
            SubmissionEventKind::Done { result } => Some(Ok(result.clone())),
            SubmissionEventKind::Failed { result } => Some(Err(Error::ExecutionFailed {
                submission_id: self.submission_id,
                cause: result.clone(),
            })),
            SubmissionEventKind::Cancelled { .. } => Some(Err(Error::SubmissionCancelled {
                submission_id: self.submission_id,
            })),
            SubmissionEventKind::Started
            | SubmissionEventKind::Progress { .. }
            | SubmissionEventKind::Suspended => None,
        }
    }

    async fn terminal_from_store(&self) -> Result<Option<Result<Value>>> {
        let Some(submission) = self.store.get_submission(&self.submission_id).await? else {
            return Ok(None);
        };
        let value = || async {
            Ok::<Value, Error>(
                self.store
                    .get_result(&self.submission_id)
                    .await?
                    .and_then(|record| record.value)
                    .unwrap_or(Value::Null),
            )
        };
        match submission.state {
            SubmissionState::Done => Ok(Some(Ok(value().await?))),
            SubmissionState::Failed => Ok(Some(Err(Error::ExecutionFailed {
                submission_id: self.submission_id,
                cause: value().await?,
            }))),
            SubmissionState::Cancelled => Ok(Some(Err(Error::SubmissionCancelled {
                submission_id: self.submission_id,
            }))),
            _ => Ok(None),
        }
    }
}
