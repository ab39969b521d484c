//! # dray-flow
//!
//! Distributed task submission and execution engine.
//!
//! This crate implements the submission lifecycle domain, providing:
//!
//! - **State Machine**: A strict submission lifecycle with CAS-guarded
//!   transitions, so concurrent dispatch and recovery cannot double-apply
//! - **Dispatch**: A pluggable dispatcher chain with policy-driven routing
//!   and explicit backpressure outcomes
//! - **Checkpoint/Resume**: Tasks yield a checkpoint and release their
//!   execution slot, resuming later from the persisted state
//! - **Lease Liveness**: Processors heartbeat time-bounded leases; expired
//!   leases trigger automatic requeueing of orphaned work
//!
//! ## Core Concepts
//!
//! - **Submission**: A unit of requested work and its lifecycle record
//! - **Dispatcher**: Answers dispatch offers with accept/reject/retry/abort
//! - **Processor**: A worker executing assigned submissions under a lease
//! - **Outcome**: The client handle for awaiting a submission's result
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dray_flow::dispatch::local::LocalExecutorDispatcher;
//! use dray_flow::error::Result;
//! use dray_flow::processor::{ProcessorKind, TaskProcessorConfig, TaskProcessorDefinition};
//! use dray_flow::session::{EngineConfig, ProcessingEngine};
//! use dray_flow::store::memory::InMemoryStore;
//! use dray_flow::submission::SubmissionConfiguration;
//! use dray_flow::task::TaskRegistry;
//! use dray_core::ProcessorId;
//!
//! # async fn demo() -> Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let registry = Arc::new(TaskRegistry::new());
//! let engine = ProcessingEngine::start(store, registry, EngineConfig::new());
//!
//! let definition = TaskProcessorDefinition::new(
//!     ProcessorId::generate(),
//!     "local-worker",
//!     ProcessorKind::Grid { threads: 4 },
//! );
//! let processor = engine.start_processor(definition.clone(), TaskProcessorConfig::new())?;
//! engine.register_dispatcher(Arc::new(LocalExecutorDispatcher::new(definition)))?;
//! # let _ = processor;
//!
//! let session = engine.session();
//! let mut outcome = session
//!     .submit(
//!         serde_json::json!({"taskType": "echo", "data": {"n": 1}}),
//!         SubmissionConfiguration::new(),
//!     )
//!     .await?;
//! let value = outcome.get().await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod controller;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod expiry;
pub mod lease;
pub mod metrics;
pub mod pending;
pub mod processor;
pub mod session;
pub mod store;
pub mod submission;
pub mod task;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::controller::{DispatchController, DispatchControllerConfig, RejectedPolicy};
    pub use crate::dispatch::{AbortResult, DispatchOutcome, Dispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::events::{SubmissionEvent, SubmissionEventKind, SubmissionOutcomeListener};
    pub use crate::expiry::{LeaseExpiryCoordinator, LeaseListener};
    pub use crate::lease::{Lease, LeaseTerm, SharedLease};
    pub use crate::metrics::EngineMetrics;
    pub use crate::pending::{DelayQueue, PendingSubmission};
    pub use crate::processor::{
        ProcessorKind, TaskProcessor, TaskProcessorConfig, TaskProcessorDefinition,
    };
    pub use crate::session::{
        EngineConfig, ProcessingEngine, ProcessingSession, SubmissionOutcome,
    };
    pub use crate::store::{CasResult, StoreEvent, SubmissionStore};
    pub use crate::submission::{
        RetentionPolicy, Submission, SubmissionConfiguration, SubmissionResult, SubmissionState,
    };
    pub use crate::task::{ResumableTask, TaskCompletion, TaskRegistry};
}
