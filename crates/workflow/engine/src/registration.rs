//! Implementation registry: maps workflow and activity types to code
//!
//! Each worker is constructed with its own registry, so several workers
//! with different capabilities can share a process.

use crate::activity::{Activity, ActivityContext, ActivityFn};
use crate::context::WorkflowContext;
use crate::definition::{WorkflowDefinition, WorkflowFn};
use crate::task_queue::Capabilities;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use workflow_types::{ActivityType, Failure, Payload, WorkflowError, WorkflowResult, WorkflowType};

/// Registered workflow and activity implementations
#[derive(Clone, Default)]
pub struct ImplementationRegistry {
    workflows: HashMap<WorkflowType, Arc<dyn WorkflowDefinition>>,
    activities: HashMap<ActivityType, Arc<dyn Activity>>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow implementation, replacing any previous one
    pub fn register_workflow(
        &mut self,
        workflow_type: impl Into<WorkflowType>,
        definition: impl WorkflowDefinition,
    ) -> &mut Self {
        let workflow_type = workflow_type.into();
        if self
            .workflows
            .insert(workflow_type.clone(), Arc::new(definition))
            .is_some()
        {
            tracing::warn!(workflow_type = %workflow_type, "Workflow implementation replaced");
        } else {
            tracing::debug!(workflow_type = %workflow_type, "Workflow implementation registered");
        }
        self
    }

    pub fn register_workflow_fn<F, Fut>(
        &mut self,
        workflow_type: impl Into<WorkflowType>,
        func: F,
    ) -> &mut Self
    where
        F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, Failure>> + 'static,
    {
        self.register_workflow(workflow_type, WorkflowFn::new(func))
    }

    /// Register an activity implementation, replacing any previous one
    pub fn register_activity(
        &mut self,
        activity_type: impl Into<ActivityType>,
        activity: impl Activity,
    ) -> &mut Self {
        let activity_type = activity_type.into();
        if self
            .activities
            .insert(activity_type.clone(), Arc::new(activity))
            .is_some()
        {
            tracing::warn!(activity_type = %activity_type, "Activity implementation replaced");
        } else {
            tracing::debug!(activity_type = %activity_type, "Activity implementation registered");
        }
        self
    }

    pub fn register_activity_fn<F, Fut>(
        &mut self,
        activity_type: impl Into<ActivityType>,
        func: F,
    ) -> &mut Self
    where
        F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, Failure>> + Send + 'static,
    {
        self.register_activity(activity_type, ActivityFn::new(func))
    }

    pub fn workflow(&self, workflow_type: &WorkflowType) -> WorkflowResult<Arc<dyn WorkflowDefinition>> {
        self.workflows
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflowType(workflow_type.clone()))
    }

    pub fn activity(&self, activity_type: &ActivityType) -> WorkflowResult<Arc<dyn Activity>> {
        self.activities
            .get(activity_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownActivityType(activity_type.clone()))
    }

    /// Task types a worker holding this registry can execute
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            self.workflows.keys().map(|t| t.to_string()),
            self.activities.keys().map(|t| t.to_string()),
        )
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }
}

impl std::fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplementationRegistry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> ImplementationRegistry {
        let mut registry = ImplementationRegistry::new();
        registry
            .register_workflow_fn("GreetingWorkflow", |_ctx, input| async move { Ok(input) })
            .register_activity_fn("greet", |_ctx, input| async move { Ok(input) });
        registry
    }

    #[test]
    fn test_lookup_registered_types() {
        let registry = make_registry();
        assert!(registry.workflow(&WorkflowType::new("GreetingWorkflow")).is_ok());
        assert!(registry.activity(&ActivityType::new("greet")).is_ok());
        assert!(matches!(
            registry.activity(&ActivityType::new("missing")),
            Err(WorkflowError::UnknownActivityType(_))
        ));
    }

    #[test]
    fn test_capabilities_follow_registrations() {
        let caps = make_registry().capabilities();
        assert!(caps.accepts_workflow("GreetingWorkflow"));
        assert!(caps.accepts_activity("greet"));
        assert!(!caps.accepts_activity("GreetingWorkflow"));
    }

    #[test]
    fn test_registries_are_isolated() {
        let first = make_registry();
        let second = ImplementationRegistry::new();
        assert_eq!(first.workflow_count(), 1);
        assert_eq!(second.workflow_count(), 0);
    }
}
