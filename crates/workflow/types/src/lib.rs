//! Durable workflow domain types
//!
//! Shared vocabulary of the executor: identifiers, payloads, typed
//! failures, history events, workflow commands, executions, activity
//! invocations and task queue entries.
//!
//! # Core Concepts
//!
//! - **History**: the append-only record of everything that happened to an
//!   execution. Workflow logic is a pure function of its history.
//! - **Command**: a decision produced by one workflow task (schedule an
//!   activity, start a timer, start a child, complete). Every command is
//!   recorded as a history event so replay can verify it.
//! - **Failure**: a serializable error with a cause chain. Failures travel
//!   through history and reach clients with the nesting intact.

#![deny(unsafe_code)]

pub mod activity;
pub mod child;
pub mod command;
pub mod errors;
pub mod execution;
pub mod failure;
pub mod history;
pub mod ids;
pub mod options;
pub mod payload;
pub mod task;

pub use activity::*;
pub use child::*;
pub use command::*;
pub use errors::*;
pub use execution::*;
pub use failure::*;
pub use history::*;
pub use ids::*;
pub use options::*;
pub use payload::*;
pub use task::*;
