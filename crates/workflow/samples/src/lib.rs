//! Sample workflows for the durable workflow executor
//!
//! Each module exposes its workflow and activity implementations plus a
//! `register` function that installs them into an
//! [`ImplementationRegistry`](workflow_engine::ImplementationRegistry):
//!
//! - [`hello_activity`] - A workflow that runs a single greeting activity
//! - [`hello_child`] - A parent that starts failing and duplicate child workflows
//! - [`hello_signal`] - A workflow that waits for a signal before greeting

pub mod hello_activity;
pub mod hello_child;
pub mod hello_signal;

use workflow_engine::{ImplementationRegistry, Worker, WorkflowService};

/// Start a worker on `task_queue` with the implementations `register` installs
pub fn start_worker(
    service: &WorkflowService,
    task_queue: &str,
    register: fn(&mut ImplementationRegistry),
) -> Worker {
    let mut registry = ImplementationRegistry::new();
    register(&mut registry);

    let mut worker = Worker::new(service.clone(), task_queue, registry);
    worker.start();
    worker
}
