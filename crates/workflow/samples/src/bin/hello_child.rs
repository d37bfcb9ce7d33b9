//! Runs the child workflow sample and prints how the parent closed.
//!
//! The parent is expected to fail: its second child start collides with a
//! running child and the `AlreadyStarted` failure is re-raised.

use anyhow::Context;
use workflow_engine::{init_tracing, EngineConfig, WorkflowService};
use workflow_samples::{hello_child, start_worker};
use workflow_types::{encode, StartWorkflowOptions, WorkflowError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("WORKFLOW_CONFIG").ok();
    let config = EngineConfig::load(config_path.as_deref()).context("loading engine configuration")?;
    init_tracing(&config.logging);

    let service = WorkflowService::new(config)?;
    let worker = start_worker(&service, hello_child::TASK_QUEUE, hello_child::register);

    let handle = service
        .start_workflow(
            hello_child::WORKFLOW_TYPE,
            encode("World")?,
            StartWorkflowOptions::new(hello_child::WORKFLOW_ID, hello_child::TASK_QUEUE),
        )
        .await?;

    match handle.result_as::<String>().await {
        Ok(greeting) => println!("{}", greeting),
        Err(WorkflowError::ExecutionFailed { failure, .. }) => {
            for (depth, cause) in failure.chain().enumerate() {
                println!("{:indent$}{}", "", cause, indent = depth * 2);
            }
        }
        Err(e) => return Err(e.into()),
    }

    worker.shutdown().await;
    Ok(())
}
