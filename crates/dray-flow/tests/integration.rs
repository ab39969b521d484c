//! Integration tests for the submission engine.
//!
//! Each test drives the full stack: session, dispatch controller,
//! dispatcher chain, processor loops, and the shared store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;

use dray_core::ProcessorId;
use dray_flow::controller::DispatchControllerConfig;
use dray_flow::dispatch::local::LocalExecutorDispatcher;
use dray_flow::dispatch::policy::RoundRobinPolicy;
use dray_flow::dispatch::routed::PolicyRoutedDispatcher;
use dray_flow::dispatch::{DispatchOutcome, Dispatcher};
use dray_flow::error::{Error, Result};
use dray_flow::events::SubmissionOutcomeListener;
use dray_flow::lease::{Lease, SharedLease};
use dray_flow::pending::PendingSubmission;
use dray_flow::processor::{
    ProcessorKind, TaskProcessorConfig, TaskProcessorDefinition, WorkRecoveryListener,
};
use dray_flow::session::{EngineConfig, ProcessingEngine};
use dray_flow::store::memory::InMemoryStore;
use dray_flow::submission::{RetentionPolicy, SubmissionConfiguration, SubmissionState};
use dray_flow::task::{task_payload, ExecutionEnvironment, ResumableTask, TaskCompletion, TaskRegistry};

struct EchoTask;

#[async_trait]
impl ResumableTask for EchoTask {
    async fn run(&self, env: &mut ExecutionEnvironment) -> Result<TaskCompletion> {
        Ok(TaskCompletion::Done(env.data().clone()))
    }
}

/// Yields a checkpoint on the first run and completes with it on resume.
struct TwoPhaseTask;

#[async_trait]
impl ResumableTask for TwoPhaseTask {
    async fn run(&self, env: &mut ExecutionEnvironment) -> Result<TaskCompletion> {
        if let Some(checkpoint) = env.checkpoint() {
            Ok(TaskCompletion::Done(checkpoint.clone()))
        } else {
            Ok(TaskCompletion::Yield {
                checkpoint: json!({"phase": 1}),
                resume_delay: Duration::ZERO,
            })
        }
    }
}

/// Spins until cancellation is requested, with a hard cap as a safety net.
struct UntilCancelledTask;

#[async_trait]
impl ResumableTask for UntilCancelledTask {
    async fn run(&self, env: &mut ExecutionEnvironment) -> Result<TaskCompletion> {
        for _ in 0..500 {
            if env.is_cancelled()? {
                return Ok(TaskCompletion::Done(json!("stopped")));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(TaskCompletion::Done(json!("never cancelled")))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(EchoTask));
    registry.register("two_phase", Arc::new(TwoPhaseTask));
    registry.register("until_cancelled", Arc::new(UntilCancelledTask));
    Arc::new(registry)
}

fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_controller(
            DispatchControllerConfig::new().with_poll_interval(Duration::from_millis(10)),
        )
        .with_lease_sweep_interval(Duration::from_millis(20))
}

fn worker_definition() -> TaskProcessorDefinition {
    TaskProcessorDefinition::new(
        ProcessorId::generate(),
        "test-worker",
        ProcessorKind::Grid { threads: 4 },
    )
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
    started: Notify,
}

impl RecordingListener {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SubmissionOutcomeListener for RecordingListener {
    fn on_started(&self) {
        self.events.lock().unwrap().push("started".into());
        self.started.notify_one();
    }
    fn on_progress(&self, _: &serde_json::Value) {
        self.events.lock().unwrap().push("progress".into());
    }
    fn on_suspended(&self) {
        self.events.lock().unwrap().push("suspended".into());
    }
    fn on_done(&self, _: &serde_json::Value) {
        self.events.lock().unwrap().push("done".into());
    }
    fn on_failed(&self, _: &serde_json::Value) {
        self.events.lock().unwrap().push("failed".into());
    }
}

/// Answers `RetryLater` on the first offer, then delegates.
struct ThrottleOnce<D> {
    inner: D,
    delay: Duration,
    offers: AtomicUsize,
}

#[async_trait]
impl<D: Dispatcher> Dispatcher for ThrottleOnce<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn dispatch(&self, pending: &PendingSubmission) -> Result<DispatchOutcome> {
        if self.offers.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(DispatchOutcome::RetryLater { delay: self.delay });
        }
        self.inner.dispatch(pending).await
    }
}

#[tokio::test]
async fn submission_executes_end_to_end() {
    init_tracing();
    let engine =
        ProcessingEngine::start(Arc::new(InMemoryStore::new()), registry(), fast_config());
    let definition = worker_definition();
    engine
        .start_processor(definition.clone(), TaskProcessorConfig::new())
        .unwrap();
    engine
        .register_dispatcher(Arc::new(LocalExecutorDispatcher::new(definition)))
        .unwrap();

    let session = engine.session();
    let mut outcome = session
        .submit(
            task_payload("echo", json!({"n": 41})),
            SubmissionConfiguration::new(),
        )
        .await
        .unwrap();

    let value = outcome.get_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, json!({"n": 41}));
    assert!(outcome.is_final_state().await.unwrap());
    assert_eq!(
        outcome.submission_state().await.unwrap(),
        Some(SubmissionState::Done)
    );
    assert!(outcome.wait_duration().await.unwrap().is_some());
    assert!(outcome.execution_duration().await.unwrap().is_some());
    engine.shutdown();
}

#[tokio::test]
async fn retry_later_delays_acceptance() {
    init_tracing();
    let engine =
        ProcessingEngine::start(Arc::new(InMemoryStore::new()), registry(), fast_config());
    let definition = worker_definition();
    engine
        .start_processor(definition.clone(), TaskProcessorConfig::new())
        .unwrap();
    let delay = Duration::from_millis(80);
    engine
        .register_dispatcher(Arc::new(ThrottleOnce {
            inner: LocalExecutorDispatcher::new(definition),
            delay,
            offers: AtomicUsize::new(0),
        }))
        .unwrap();

    let session = engine.session();
    let started = Instant::now();
    let mut outcome = session
        .submit(task_payload("echo", json!(1)), SubmissionConfiguration::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.get_timeout(Duration::from_secs(5)).await.unwrap(),
        json!(1)
    );
    // The first offer was throttled, so completion waits out the delay.
    assert!(started.elapsed() >= delay);
    engine.shutdown();
}

#[tokio::test]
async fn yielded_task_resumes_from_checkpoint() {
    init_tracing();
    let engine =
        ProcessingEngine::start(Arc::new(InMemoryStore::new()), registry(), fast_config());
    let definition = worker_definition();
    engine
        .start_processor(definition.clone(), TaskProcessorConfig::new())
        .unwrap();
    engine
        .register_dispatcher(Arc::new(LocalExecutorDispatcher::new(definition)))
        .unwrap();

    let session = engine.session();
    let listener = Arc::new(RecordingListener::default());
    let mut outcome = session
        .submit_with_listener(
            task_payload("two_phase", json!(null)),
            SubmissionConfiguration::new(),
            listener.clone(),
        )
        .await
        .unwrap();

    // The final value is the checkpoint persisted by the yielding run.
    let value = outcome.get_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, json!({"phase": 1}));

    // Give the listener delivery task a moment to drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = listener.events();
    assert_eq!(
        events.iter().filter(|e| *e == "started").count(),
        2,
        "start fires for the fresh run and again on resume: {events:?}"
    );
    assert_eq!(events.iter().filter(|e| *e == "suspended").count(), 1);
    assert_eq!(events.last().map(String::as_str), Some("done"));
    engine.shutdown();
}

#[tokio::test]
async fn expired_lease_requeues_orphaned_work() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let engine = ProcessingEngine::start(store.clone(), registry(), fast_config());

    // A healthy worker, and a phantom worker that will never execute.
    let healthy = worker_definition();
    engine
        .start_processor(healthy.clone(), TaskProcessorConfig::new())
        .unwrap();
    let phantom = TaskProcessorDefinition::new(
        ProcessorId::generate(),
        "phantom-worker",
        ProcessorKind::Single,
    );

    let routed = Arc::new(PolicyRoutedDispatcher::new(Arc::new(RoundRobinPolicy::new())));
    routed.register_processor(phantom.clone()).unwrap();
    engine.register_dispatcher(routed.clone()).unwrap();

    let session = engine.session();
    let outcome = session
        .submit(task_payload("echo", json!("recovered")), SubmissionConfiguration::new())
        .await
        .unwrap();
    let id = outcome.identifier();

    // Wait until the submission is stranded on the phantom worker.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let state = outcome.submission_state().await.unwrap();
        if state == Some(SubmissionState::Assigned) {
            break;
        }
        assert!(Instant::now() < deadline, "submission never assigned");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Reroute future dispatches to the healthy worker, then let the
    // phantom's already-expired lease fire.
    routed.deregister_processor(&phantom.id).unwrap();
    routed.register_processor(healthy).unwrap();
    let expired = SharedLease::new(Lease::acquired(
        Duration::from_millis(50),
        Utc::now() - chrono::Duration::seconds(1),
    ));
    let recovery = Arc::new(WorkRecoveryListener::new(
        store.clone(),
        engine.controller(),
    ));
    engine
        .coordinator()
        .register(phantom.id, expired, recovery)
        .unwrap();

    let mut outcome = session
        .acquire_submission(id, RetentionPolicy::ExplicitRemove, None)
        .await
        .unwrap();
    let value = outcome.get_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, json!("recovered"));
    engine.shutdown();
}

#[tokio::test]
async fn cancel_while_executing_is_immediately_terminal() {
    init_tracing();
    let engine =
        ProcessingEngine::start(Arc::new(InMemoryStore::new()), registry(), fast_config());
    let definition = worker_definition();
    engine
        .start_processor(definition.clone(), TaskProcessorConfig::new())
        .unwrap();
    engine
        .register_dispatcher(Arc::new(LocalExecutorDispatcher::new(definition)))
        .unwrap();

    let session = engine.session();
    let listener = Arc::new(RecordingListener::default());
    let mut outcome = session
        .submit_with_listener(
            task_payload("until_cancelled", json!(null)),
            SubmissionConfiguration::new(),
            listener.clone(),
        )
        .await
        .unwrap();
    let id = outcome.identifier();

    // Cancel only once the task is actually running.
    tokio::time::timeout(Duration::from_secs(5), listener.started.notified())
        .await
        .expect("task never started");
    assert!(session.cancel_submission(id).await.unwrap());

    // Terminal immediately, without waiting for the worker to notice.
    assert!(outcome.is_final_state().await.unwrap());
    assert_eq!(
        outcome.submission_state().await.unwrap(),
        Some(SubmissionState::Cancelled)
    );
    let err = outcome.get().await.unwrap_err();
    assert!(matches!(err, Error::SubmissionCancelled { submission_id } if submission_id == id));
    engine.shutdown();
}

#[tokio::test]
async fn progress_reports_reach_the_outcome_handle() {
    init_tracing();
    struct ProgressTask;

    #[async_trait]
    impl ResumableTask for ProgressTask {
        async fn run(&self, env: &mut ExecutionEnvironment) -> Result<TaskCompletion> {
            env.report_progress(json!(50)).await?;
            Ok(TaskCompletion::Done(json!("finished")))
        }
    }

    let mut tasks = TaskRegistry::new();
    tasks.register("progress", Arc::new(ProgressTask));
    let engine = ProcessingEngine::start(
        Arc::new(InMemoryStore::new()),
        Arc::new(tasks),
        fast_config(),
    );
    let definition = worker_definition();
    engine
        .start_processor(definition.clone(), TaskProcessorConfig::new())
        .unwrap();
    engine
        .register_dispatcher(Arc::new(LocalExecutorDispatcher::new(definition)))
        .unwrap();

    let session = engine.session();
    let listener = Arc::new(RecordingListener::default());
    let mut outcome = session
        .submit_with_listener(
            task_payload("progress", json!(null)),
            SubmissionConfiguration::new(),
            listener.clone(),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.get_timeout(Duration::from_secs(5)).await.unwrap(),
        json!("finished")
    );
    assert_eq!(outcome.progress().await.unwrap(), Some(json!(50)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(listener.events().contains(&"progress".to_string()));
    engine.shutdown();
}
