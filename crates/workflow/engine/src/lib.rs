//! Durable workflow execution engine
//!
//! Workflow logic is ordinary async Rust that talks to the world only
//! through a [`WorkflowContext`]. Every decision it makes is recorded in the
//! execution's history; after a crash, or simply on the next workflow task,
//! the logic is re-executed against that history and resumes exactly where
//! it left off.
//!
//! # Key Principle
//!
//! **The engine never runs user code.** It records history, hands out tasks
//! and reacts to their results. Workers run the code.
//!
//! # Architecture
//!
//! The [`WorkflowService`] wraps the synchronous [`ExecutionEngine`], which
//! composes specialized components:
//!
//! - [`WorkflowRegistry`] - Enforces workflow id uniqueness per task queue
//! - [`ActivityDispatcher`] - Tracks activity attempts, timeouts and retries
//! - [`TaskQueues`] - Leases workflow and activity tasks to capable pollers
//! - [`TimerService`] - Arms durable timers, timeouts and retry backoffs
//! - [`HistoryStore`] - Persists histories for recovery
//!
//! [`Worker`]s poll the task queues and run registered implementations;
//! workflow tasks go through the [`replay`] runner.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use workflow_engine::{EngineConfig, ImplementationRegistry, Worker, WorkflowContext, WorkflowService};
//! use workflow_types::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = WorkflowService::new(EngineConfig::default())?;
//!
//! let mut registry = ImplementationRegistry::new();
//! registry
//!     .register_workflow_fn("GreetingWorkflow", |ctx: WorkflowContext, input: Payload| async move {
//!         let options = ActivityOptions::with_start_to_close(Duration::from_secs(2));
//!         ctx.execute_activity("greet", input, options).await
//!     })
//!     .register_activity_fn("greet", |_ctx, input: Payload| async move {
//!         let name: String = decode(&input)?;
//!         encode(&format!("Hello {}!", name))
//!     });
//!
//! let mut worker = Worker::new(service.clone(), "HelloActivityTaskQueue", registry);
//! worker.start();
//!
//! let handle = service
//!     .start_workflow(
//!         "GreetingWorkflow",
//!         encode("World")?,
//!         StartWorkflowOptions::new("HelloActivityWorkflow", "HelloActivityTaskQueue"),
//!     )
//!     .await?;
//! assert_eq!(handle.result().await?, serde_json::json!("Hello World!"));
//!
//! worker.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod activity;
pub mod config;
pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod observability;
pub mod orchestrator;
pub mod registration;
pub mod registry;
pub mod replay;
pub mod service;
pub mod store;
pub mod task_queue;
pub mod timer;
pub mod worker;

// Re-export main types
pub use activity::{Activity, ActivityContext, ActivityFn, ActivityInfo};
pub use config::EngineConfig;
pub use context::{WorkflowContext, WorkflowInfo, DEFAULT_VERSION};
pub use definition::{WorkflowDefinition, WorkflowFn, WorkflowFuture};
pub use dispatcher::ActivityDispatcher;
pub use observability::{init_tracing, EventBus, ExecutionEvent};
pub use orchestrator::{Effect, ExecutionEngine, WorkflowTask};
pub use registration::ImplementationRegistry;
pub use registry::WorkflowRegistry;
pub use replay::{replay_history, run_workflow_task, ReplayRunner};
pub use service::{WorkflowHandle, WorkflowService};
pub use store::{FileHistoryStore, HistoryStore, MemoryHistoryStore, StoreConfig};
pub use task_queue::{Capabilities, TaskQueues};
pub use timer::{TimerId, TimerService};
pub use worker::Worker;
