//! Parent workflow exercising child workflow failures.
//!
//! The parent first runs a child whose activity raises a non-retryable
//! failure and swallows the resulting child failure. It then starts a child
//! under a fixed id and, while that child is still running, a second child
//! with the same id. The second start is rejected with `AlreadyStarted`,
//! which the parent re-raises as its own failure.

use std::time::Duration;
use workflow_engine::{ActivityContext, ImplementationRegistry, WorkflowContext};
use workflow_types::{decode, encode, ActivityOptions, ChildWorkflowOptions, Failure, Payload};

pub const TASK_QUEUE: &str = "HelloChildTaskQueue";
pub const WORKFLOW_ID: &str = "HelloChildWorkflow";
pub const WORKFLOW_TYPE: &str = "GreetingWorkflow";
pub const CHILD_WORKFLOW_TYPE: &str = "GreetingChild";
pub const CHILD_WORKFLOW_ID: &str = "my_child_workflowId";
pub const GET_GREETING_ACTIVITY: &str = "getGreeting";

pub const MY_EXCEPTION: &str = "myException";

pub async fn greeting_workflow(ctx: WorkflowContext, _input: Payload) -> Result<Payload, Failure> {
    match ctx
        .execute_child_workflow(CHILD_WORKFLOW_TYPE, encode(&true)?, ChildWorkflowOptions::default())
        .await
    {
        Ok(_) => {}
        Err(failure) => {
            if !ctx.is_replaying() {
                let activity_failed = failure.cause().is_some_and(Failure::is_activity);
                tracing::info!(
                    activity_failed,
                    root_cause = %failure.root_cause().message,
                    "Ignoring child workflow failure"
                );
            }
        }
    }

    let options = ChildWorkflowOptions::with_id(CHILD_WORKFLOW_ID);
    let duplicate_start = async {
        ctx.start_child_workflow(CHILD_WORKFLOW_TYPE, encode(&false)?, options.clone())
            .started()
            .await?;
        ctx.start_child_workflow(CHILD_WORKFLOW_TYPE, encode(&false)?, options)
            .started()
            .await?;
        Ok::<(), Failure>(())
    };

    if let Err(failure) = duplicate_start.await {
        if failure.cause().is_some_and(Failure::is_already_started) {
            return Err(failure);
        }
    }

    encode("done")
}

/// Runs the greeting activity, optionally failing it, then sleeps
pub async fn greeting_child(ctx: WorkflowContext, input: Payload) -> Result<Payload, Failure> {
    let throw_exception: bool = decode(&input)?;
    ctx.execute_activity(
        GET_GREETING_ACTIVITY,
        encode(&throw_exception)?,
        ActivityOptions::with_start_to_close(Duration::from_secs(2)),
    )
    .await?;
    ctx.sleep(Duration::from_secs(2)).await;
    encode("")
}

pub async fn get_greeting(_ctx: ActivityContext, input: Payload) -> Result<Payload, Failure> {
    let throw_exception: bool = decode(&input)?;
    if throw_exception {
        return Err(Failure::non_retryable(MY_EXCEPTION, "my exception"));
    }
    encode("")
}

pub fn register(registry: &mut ImplementationRegistry) {
    registry
        .register_workflow_fn(WORKFLOW_TYPE, greeting_workflow)
        .register_workflow_fn(CHILD_WORKFLOW_TYPE, greeting_child)
        .register_activity_fn(GET_GREETING_ACTIVITY, get_greeting);
}
