//! # dray-core
//!
//! Core abstractions for the Dray task submission and execution engine.
//!
//! This crate provides the foundational types shared across all Dray
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for submissions, results, and
//!   task processors
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `dray-core` is the only crate allowed to define shared primitives.
//! Everything else lives in `dray-flow`, which depends on this crate.
//!
//! ## Example
//!
//! ```rust
//! use dray_core::{ProcessorId, SubmissionId};
//!
//! let submission = SubmissionId::generate();
//! let processor = ProcessorId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::{ProcessorId, ResultId, SubmissionId};
