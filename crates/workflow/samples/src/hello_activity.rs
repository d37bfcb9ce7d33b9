//! Greeting workflow backed by a single activity

use serde::{Deserialize, Serialize};
use std::time::Duration;
use workflow_engine::{ActivityContext, ImplementationRegistry, WorkflowContext, DEFAULT_VERSION};
use workflow_types::{decode, encode, ActivityOptions, Failure, Payload};

pub const TASK_QUEUE: &str = "HelloActivityTaskQueue";
pub const WORKFLOW_ID: &str = "HelloActivityWorkflow";
pub const WORKFLOW_TYPE: &str = "GreetingWorkflow";
pub const MULTILINGUAL_WORKFLOW_TYPE: &str = "MultilingualGreetingWorkflow";

pub const GREET_ACTIVITY: &str = "greet";
pub const LOCALIZED_GREET_ACTIVITY: &str = "localizedGreet";

/// Change id guarding the switch to localized greetings
pub const LOCALIZED_CHANGE: &str = "localized-greeting";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreetRequest {
    pub greeting: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizedGreetRequest {
    pub name: String,
    pub language: String,
}

fn activity_options() -> ActivityOptions {
    ActivityOptions::with_start_to_close(Duration::from_secs(2))
}

/// Returns `"Hello {name}!"` for the name given as input
pub async fn greeting_workflow(ctx: WorkflowContext, input: Payload) -> Result<Payload, Failure> {
    let name: String = decode(&input)?;
    let request = GreetRequest {
        greeting: "Hello".to_string(),
        name,
    };
    ctx.execute_activity(GREET_ACTIVITY, encode(&request)?, activity_options())
        .await
}

/// Greeting in the requested language.
///
/// Executions that started before localized greetings existed keep using
/// the plain greeting activity when they replay.
pub async fn multilingual_workflow(ctx: WorkflowContext, input: Payload) -> Result<Payload, Failure> {
    let request: LocalizedGreetRequest = decode(&input)?;
    let version = ctx.get_version(LOCALIZED_CHANGE, DEFAULT_VERSION, 1)?;

    if version == DEFAULT_VERSION {
        let request = GreetRequest {
            greeting: "Hello".to_string(),
            name: request.name,
        };
        return ctx
            .execute_activity(GREET_ACTIVITY, encode(&request)?, activity_options())
            .await;
    }

    ctx.execute_activity(LOCALIZED_GREET_ACTIVITY, encode(&request)?, activity_options())
        .await
}

pub async fn compose_greeting(_ctx: ActivityContext, input: Payload) -> Result<Payload, Failure> {
    let request: GreetRequest = decode(&input)?;
    tracing::info!(name = %request.name, "Composing greeting");
    encode(&format!("{} {}!", request.greeting, request.name))
}

pub async fn localized_greeting(_ctx: ActivityContext, input: Payload) -> Result<Payload, Failure> {
    let request: LocalizedGreetRequest = decode(&input)?;
    let greeting = match request.language.as_str() {
        "Spanish" => "Hola",
        "French" => "Bonjour",
        _ => "Hello",
    };
    encode(&format!("{} {}", greeting, request.name))
}

pub fn register(registry: &mut ImplementationRegistry) {
    registry
        .register_workflow_fn(WORKFLOW_TYPE, greeting_workflow)
        .register_workflow_fn(MULTILINGUAL_WORKFLOW_TYPE, multilingual_workflow)
        .register_activity_fn(GREET_ACTIVITY, compose_greeting)
        .register_activity_fn(LOCALIZED_GREET_ACTIVITY, localized_greeting);
}

