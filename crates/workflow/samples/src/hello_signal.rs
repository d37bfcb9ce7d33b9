//! Greeting that only runs once a completion signal arrives

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use workflow_engine::{ActivityContext, ImplementationRegistry, WorkflowContext};
use workflow_types::{decode, encode, ActivityOptions, Failure, Payload};

pub const TASK_QUEUE: &str = "HelloSignalTaskQueue";
pub const WORKFLOW_TYPE: &str = "SayHelloWorkflow";
pub const SIGNAL_COMPLETE: &str = "signal_complete";
pub const SAY_HELLO_ACTIVITY: &str = "say_hello_activity";

pub async fn say_hello_workflow(ctx: WorkflowContext, input: Payload) -> Result<Payload, Failure> {
    let name: String = decode(&input)?;
    let complete = Rc::new(Cell::new(false));

    let listener = {
        let ctx = ctx.clone();
        let complete = complete.clone();
        async move {
            ctx.wait_signal(SIGNAL_COMPLETE).await;
            complete.set(true);
        }
    };
    let gate = {
        let complete = complete.clone();
        ctx.wait_condition(move || complete.get())
    };
    futures::join!(listener, gate);

    ctx.execute_activity(
        SAY_HELLO_ACTIVITY,
        encode(&name)?,
        ActivityOptions::with_start_to_close(Duration::from_secs(300)),
    )
    .await
}

pub async fn say_hello(_ctx: ActivityContext, input: Payload) -> Result<Payload, Failure> {
    let name: String = decode(&input)?;
    encode(&format!("Hello, {}!", name))
}

pub fn register(registry: &mut ImplementationRegistry) {
    registry
        .register_workflow_fn(WORKFLOW_TYPE, say_hello_workflow)
        .register_activity_fn(SAY_HELLO_ACTIVITY, say_hello);
}
