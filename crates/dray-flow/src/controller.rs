//! Dispatch loop: offers ready pending submissions to dispatchers and
//! acts on their outcomes.
//!
//! The controller owns all dispatch-side state transitions. Dispatchers
//! only answer; acceptance, abort finalization, and requeueing happen
//! here, CAS-guarded so a concurrent expiry-triggered retry for the same
//! submission cannot double-apply.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::{AbortResult, DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::events::{EventBus, SubmissionEvent, SubmissionEventKind};
use crate::metrics::EngineMetrics;
use crate::pending::{DelayQueue, PendingSubmission};
use crate::store::SubmissionStore;
use crate::submission::{RetentionPolicy, StateTransitionReason, SubmissionState};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("dispatch queue lock poisoned")
}

/// What to do with a submission every dispatcher rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedPolicy {
    /// Park it until a dispatcher registration or capacity update arrives.
    WaitForUpdate,
    /// Requeue it after a fixed delay.
    RetryAfter(Duration),
}

/// Controller tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct DispatchControllerConfig {
    /// Handling of submissions no dispatcher would take.
    pub rejected_policy: RejectedPolicy,
    /// Upper bound on the dispatch loop's sleep between passes.
    pub poll_interval: Duration,
}

impl Default for DispatchControllerConfig {
    fn default() -> Self {
        Self {
            rejected_policy: RejectedPolicy::WaitForUpdate,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl DispatchControllerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rejected-submission policy.
    #[must_use]
    pub const fn with_rejected_policy(mut self, policy: RejectedPolicy) -> Self {
        self.rejected_policy = policy;
        self
    }

    /// Sets the dispatch loop poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

enum OfferResult {
    /// Accepted or aborted; the submission left the dispatch queue.
    Handled,
    /// At least one dispatcher asked for a later retry.
    RetryAfter(Duration),
    /// Every dispatcher rejected it.
    Unplaced,
}

/// Offers pending submissions to dispatchers in registration order.
pub struct DispatchController {
    store: Arc<dyn SubmissionStore>,
    bus: EventBus,
    config: DispatchControllerConfig,
    dispatchers: RwLock<Vec<Arc<dyn Dispatcher>>>,
    queue: Mutex<DelayQueue>,
    parked: Mutex<Vec<PendingSubmission>>,
    notify: Notify,
    metrics: EngineMetrics,
}

impl DispatchController {
    /// Creates a controller with no dispatchers registered.
    #[must_use]
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        bus: EventBus,
        config: DispatchControllerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            dispatchers: RwLock::new(Vec::new()),
            queue: Mutex::new(DelayQueue::new()),
            parked: Mutex::new(Vec::new()),
            notify: Notify::new(),
            metrics: EngineMetrics::new(),
        }
    }

    /// Registers a dispatcher at the end of the offer chain and re-offers
    /// parked submissions.
    pub fn register_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
        self.dispatchers.write().map_err(poison_err)?.push(dispatcher);
        self.on_dispatcher_update()
    }

    /// Accepts a pending submission into the dispatch queue.
    pub fn accept(&self, pending: PendingSubmission) -> Result<()> {
        let depth = {
            let mut queue = self.queue.lock().map_err(poison_err)?;
            queue.push(pending);
            queue.len()
        };
        self.metrics.set_queue_depth(depth);
        self.notify.notify_one();
        Ok(())
    }

    /// Removes a still-pending submission from the queue or the parked set.
    ///
    /// Returns true if an entry was removed.
    pub fn discard(&self, id: &dray_core::SubmissionId) -> Result<bool> {
        if self.queue.lock().map_err(poison_err)?.discard(id) {
            return Ok(true);
        }
        let mut parked = self.parked.lock().map_err(poison_err)?;
        let before = parked.len();
        parked.retain(|p| p.submission_id() != *id);
        Ok(parked.len() < before)
    }

    /// Re-offers parked submissions after a dispatcher or capacity change.
    pub fn on_dispatcher_update(&self) -> Result<()> {
        let parked: Vec<PendingSubmission> =
            self.parked.lock().map_err(poison_err)?.drain(..).collect();
        if !parked.is_empty() {
            let mut queue = self.queue.lock().map_err(poison_err)?;
            for pending in parked {
                queue.push(pending);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Offers every ready submission once and acts on the outcomes.
    ///
    /// Returns the number of submissions that left the queue (accepted or
    /// aborted). Rejections and retry requests requeue or park per config.
    pub async fn dispatch_ready(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut handled = 0;
        loop {
            let next = self.queue.lock().map_err(poison_err)?.pop_ready(now);
            let Some(mut pending) = next else {
                break;
            };
            match self.offer(&pending, now).await? {
                OfferResult::Handled => handled += 1,
                OfferResult::RetryAfter(delay) => {
                    pending.delay_until(delay, now);
                    self.queue.lock().map_err(poison_err)?.push(pending);
                }
                OfferResult::Unplaced => match self.config.rejected_policy {
                    RejectedPolicy::WaitForUpdate => {
                        self.parked.lock().map_err(poison_err)?.push(pending);
                    }
                    RejectedPolicy::RetryAfter(delay) => {
                        pending.delay_until(delay, now);
                        self.queue.lock().map_err(poison_err)?.push(pending);
                    }
                },
            }
        }
        let depth = self.queue.lock().map_err(poison_err)?.len();
        self.metrics.set_queue_depth(depth);
        Ok(handled)
    }

    /// Offers one submission along the dispatcher chain.
    async fn offer(&self, pending: &PendingSubmission, _now: DateTime<Utc>) -> Result<OfferResult> {
        let dispatchers: Vec<Arc<dyn Dispatcher>> =
            self.dispatchers.read().map_err(poison_err)?.clone();
        let submission_id = pending.submission_id();
        let mut min_delay: Option<Duration> = None;

        for dispatcher in dispatchers {
            if let Some(filter) = &pending.configuration.dispatcher_filter {
                if dispatcher.name() != filter {
                    continue;
                }
            }
            let outcome = match dispatcher.dispatch(pending).await {
                Ok(outcome) => outcome,
                // A faulty dispatcher costs one attempt, never the loop.
                Err(error) => {
                    warn!(
                        %submission_id,
                        dispatcher = dispatcher.name(),
                        %error,
                        "dispatcher failed, treating as rejection"
                    );
                    self.metrics.record_dispatch("error", dispatcher.name());
                    continue;
                }
            };
            self.metrics
                .record_dispatch(outcome.as_label(), dispatcher.name());
            match outcome {
                DispatchOutcome::Accepted { owner } => {
                    let reason = if pending.dispatch_state == SubmissionState::Suspended {
                        StateTransitionReason::ResumeDispatched
                    } else {
                        StateTransitionReason::DispatchAccepted
                    };
                    let cas = self
                        .store
                        .cas_submission_state(
                            &submission_id,
                            pending.dispatch_state,
                            SubmissionState::Assigned,
                            reason,
                        )
                        .await?;
                    if cas.is_success() {
                        self.store.set_owner(&submission_id, Some(owner)).await?;
                        // The assignment becomes visible to the processor
                        // only after the state and owner are committed, so a
                        // drain can never observe an uncommitted acceptance.
                        self.store.append_assignment(&owner, &pending.key).await?;
                        debug!(
                            %submission_id,
                            processor_id = %owner,
                            dispatcher = dispatcher.name(),
                            "submission assigned"
                        );
                    } else {
                        // Lost the race to cancellation or expiry retry;
                        // the stale assignment is skipped by the processor.
                        debug!(%submission_id, ?cas, "assignment superseded");
                    }
                    return Ok(OfferResult::Handled);
                }
                DispatchOutcome::Rejected => {}
                DispatchOutcome::RetryLater { delay } => {
                    min_delay = Some(min_delay.map_or(delay, |d| d.min(delay)));
                }
                DispatchOutcome::Abort { rationale, result } => {
                    warn!(
                        %submission_id,
                        dispatcher = dispatcher.name(),
                        rationale,
                        "dispatch aborted"
                    );
                    self.finalize_abort(pending, result).await?;
                    return Ok(OfferResult::Handled);
                }
            }
        }

        Ok(min_delay.map_or(OfferResult::Unplaced, OfferResult::RetryAfter))
    }

    /// Finalizes an aborted submission with its terminal result.
    async fn finalize_abort(&self, pending: &PendingSubmission, result: AbortResult) -> Result<()> {
        let submission_id = pending.submission_id();
        let (target, value, kind) = match result {
            AbortResult::Success(value) => (
                SubmissionState::Done,
                value.clone(),
                SubmissionEventKind::Done { result: value },
            ),
            AbortResult::Failure(value) => (
                SubmissionState::Failed,
                value.clone(),
                SubmissionEventKind::Failed { result: value },
            ),
        };
        let cas = self
            .store
            .cas_submission_state(
                &submission_id,
                pending.dispatch_state,
                target,
                StateTransitionReason::DispatchAborted,
            )
            .await?;
        if !cas.is_success() {
            debug!(%submission_id, ?cas, "abort superseded");
            return Ok(());
        }

        let mut retention = RetentionPolicy::ExplicitRemove;
        if let Some(mut record) = self.store.get_result(&submission_id).await? {
            record.value = Some(value);
            record.execution_finished_at = Some(Utc::now());
            retention = record.retention;
            self.store.save_result(&record).await?;
        }
        self.bus.publish(SubmissionEvent::new(submission_id, kind));
        if retention == RetentionPolicy::RemoveOnFinalState {
            self.store.remove_pair(&submission_id).await?;
        }
        Ok(())
    }

    /// Spawns the dispatch loop.
    ///
    /// The loop wakes on [`DispatchController::accept`] and
    /// [`DispatchController::on_dispatcher_update`], or after the poll
    /// interval, whichever comes first. The handle is aborted on engine
    /// shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(error) = self.dispatch_ready(Utc::now()).await {
                    warn!(%error, "dispatch pass failed");
                }
                let wait = self
                    .next_ready_in(Utc::now())
                    .map_or(self.config.poll_interval, |until| {
                        until.min(self.config.poll_interval)
                    });
                tokio::select! {
                    () = self.notify.notified() => {}
                    () = tokio::time::sleep(wait) => {}
                }
            }
        })
    }

    fn next_ready_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        let queue = self.queue.lock().ok()?;
        let at = queue.next_ready_at()?;
        Some((at - now).to_std().unwrap_or(Duration::ZERO))
    }
}
