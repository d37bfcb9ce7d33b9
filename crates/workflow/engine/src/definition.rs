//! Workflow definitions: the deterministic logic run by workflow tasks

use crate::context::WorkflowContext;
use std::future::Future;
use std::pin::Pin;
use workflow_types::{Failure, Payload};

/// Future returned by a workflow run.
///
/// Workflow futures are polled on the replaying thread only, so they need
/// not be `Send`; the context they hold is shared through `Rc`.
pub type WorkflowFuture = Pin<Box<dyn Future<Output = Result<Payload, Failure>>>>;

/// Deterministic workflow logic.
///
/// `run` is invoked again from scratch on every workflow task, so it must
/// depend only on its input and on what the context reveals. Use the
/// context for time, randomness, sleeping and anything non-deterministic.
pub trait WorkflowDefinition: Send + Sync + 'static {
    fn run(&self, ctx: WorkflowContext, input: Payload) -> WorkflowFuture;
}

/// Adapter turning an async function into a [`WorkflowDefinition`]
pub struct WorkflowFn<F> {
    func: F,
}

impl<F> WorkflowFn<F> {
    pub fn new<Fut>(func: F) -> Self
    where
        F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, Failure>> + 'static,
    {
        Self { func }
    }
}

impl<F, Fut> WorkflowDefinition for WorkflowFn<F>
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, Failure>> + 'static,
{
    fn run(&self, ctx: WorkflowContext, input: Payload) -> WorkflowFuture {
        Box::pin((self.func)(ctx, input))
    }
}
