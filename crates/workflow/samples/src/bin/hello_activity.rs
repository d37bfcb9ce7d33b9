//! Runs the greeting workflow on an in-process engine and prints its result.
//!
//! Configuration is read from the file named by `WORKFLOW_CONFIG`, then from
//! `WORKFLOW_*` environment variables.

use anyhow::Context;
use workflow_engine::{init_tracing, EngineConfig, WorkflowService};
use workflow_samples::{hello_activity, start_worker};
use workflow_types::{encode, StartWorkflowOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("WORKFLOW_CONFIG").ok();
    let config = EngineConfig::load(config_path.as_deref()).context("loading engine configuration")?;
    init_tracing(&config.logging);

    let service = WorkflowService::new(config)?;
    let worker = start_worker(&service, hello_activity::TASK_QUEUE, hello_activity::register);

    let handle = service
        .start_workflow(
            hello_activity::WORKFLOW_TYPE,
            encode("World")?,
            StartWorkflowOptions::new(hello_activity::WORKFLOW_ID, hello_activity::TASK_QUEUE),
        )
        .await?;
    let greeting: String = handle.result_as().await?;

    println!("{}", greeting);
    worker.shutdown().await;
    Ok(())
}
