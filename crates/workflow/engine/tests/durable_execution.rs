use futures::future::{select, Either};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use workflow_engine::{
    replay_history, ActivityContext, EngineConfig, FileHistoryStore, HistoryStore, ImplementationRegistry,
    Worker, WorkflowContext, WorkflowService,
};
use workflow_types::*;

const QUEUE: &str = "HelloActivityTaskQueue";

fn greeting_workflow(ctx: WorkflowContext, input: Payload) -> impl std::future::Future<Output = Result<Payload, Failure>> {
    async move {
        let name: String = decode(&input)?;
        ctx.execute_activity(
            "greet",
            encode(&("Hello", name))?,
            ActivityOptions::with_start_to_close(Duration::from_secs(2)),
        )
        .await
    }
}

fn greeting_registry(calls: Arc<AtomicU32>) -> ImplementationRegistry {
    let mut registry = ImplementationRegistry::new();
    registry
        .register_workflow_fn("GreetingWorkflow", greeting_workflow)
        .register_activity_fn("greet", move |_ctx, input: Payload| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let (greeting, name): (String, String) = decode(&input)?;
                encode(&format!("{} {}!", greeting, name))
            }
        });
    registry
}

fn start_worker(service: &WorkflowService, registry: ImplementationRegistry) -> Worker {
    let mut worker = Worker::new(service.clone(), QUEUE, registry);
    worker.start();
    worker
}

#[tokio::test]
async fn greeting_completes_and_replays_to_same_result() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let worker = start_worker(&service, greeting_registry(calls.clone()));

    let handle = service
        .start_workflow(
            "GreetingWorkflow",
            encode("World").unwrap(),
            StartWorkflowOptions::new("HelloActivityWorkflow", QUEUE),
        )
        .await
        .unwrap();
    assert_eq!(handle.result().await.unwrap(), serde_json::json!("Hello World!"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let info = handle.describe().await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert!(info.closed_at.unwrap() >= info.started_at);

    let history = handle.history().await.unwrap();
    let replayed = replay_history(
        &workflow_engine::WorkflowFn::new(greeting_workflow),
        handle.run_id().clone(),
        history.events(),
    )
    .unwrap();
    assert_eq!(replayed, Some(Ok(serde_json::json!("Hello World!"))));

    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_exactly_one_run() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let attempts = (0..16).map(|_| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .start_workflow(
                    "GreetingWorkflow",
                    encode("World").unwrap(),
                    StartWorkflowOptions::new("HelloActivityWorkflow", QUEUE),
                )
                .await
        })
    });

    let mut started = 0;
    for attempt in futures::future::join_all(attempts).await {
        match attempt.unwrap() {
            Ok(_) => started += 1,
            Err(WorkflowError::AlreadyStarted { workflow_id, .. }) => {
                assert_eq!(workflow_id.as_str(), "HelloActivityWorkflow")
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(started, 1);
}

#[tokio::test]
async fn same_id_on_another_queue_is_independent() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    service
        .start_workflow("GreetingWorkflow", Payload::Null, StartWorkflowOptions::new("wf", QUEUE))
        .await
        .unwrap();
    service
        .start_workflow("GreetingWorkflow", Payload::Null, StartWorkflowOptions::new("wf", "OtherQueue"))
        .await
        .unwrap();
}

#[tokio::test]
async fn reject_duplicate_policy_blocks_reuse_after_close() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let options = StartWorkflowOptions::new("wf", QUEUE).id_reuse_policy(WorkflowIdReusePolicy::RejectDuplicate);
    service
        .start_workflow("GreetingWorkflow", Payload::Null, options.clone())
        .await
        .unwrap()
        .terminate("done with it")
        .await
        .unwrap();

    assert!(matches!(
        service.start_workflow("GreetingWorkflow", Payload::Null, options).await,
        Err(WorkflowError::AlreadyStarted { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempt_is_retried() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = ImplementationRegistry::new();
    registry
        .register_workflow_fn("SlowWorkflow", |ctx: WorkflowContext, _input: Payload| async move {
            ctx.execute_activity(
                "slow",
                Payload::Null,
                ActivityOptions::with_start_to_close(Duration::from_secs(2)),
            )
            .await
        })
        .register_activity_fn("slow", {
            let attempts = attempts.clone();
            move |ctx, _input: Payload| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() == 1 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    encode(&ctx.attempt())
                }
            }
        });
    let worker = start_worker(&service, registry);

    let handle = service
        .start_workflow("SlowWorkflow", Payload::Null, StartWorkflowOptions::new("slow", QUEUE))
        .await
        .unwrap();
    assert_eq!(handle.result().await.unwrap(), serde_json::json!(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_runs_once() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = ImplementationRegistry::new();
    registry
        .register_workflow_fn("FailingWorkflow", |ctx: WorkflowContext, _input: Payload| async move {
            ctx.execute_activity(
                "getGreeting",
                Payload::Null,
                ActivityOptions::with_start_to_close(Duration::from_secs(2)),
            )
            .await
        })
        .register_activity_fn("getGreeting", {
            let attempts = attempts.clone();
            move |_ctx, _input: Payload| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<Payload, _>(Failure::non_retryable("myException", "my exception"))
                }
            }
        });
    let worker = start_worker(&service, registry);

    let handle = service
        .start_workflow("FailingWorkflow", Payload::Null, StartWorkflowOptions::new("failing", QUEUE))
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    let failure = err.failure().unwrap();
    assert!(failure.is_activity());
    assert!(matches!(
        failure.kind,
        FailureKind::Activity {
            retry_state: RetryState::NonRetryableFailure,
            attempt: 1,
            ..
        }
    ));
    assert_eq!(failure.root_cause().error_type(), Some("myException"));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(handle.describe().await.unwrap().status, WorkflowStatus::Failed);
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_maximum_attempts() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = ImplementationRegistry::new();
    registry
        .register_workflow_fn("FlakyWorkflow", |ctx: WorkflowContext, _input: Payload| async move {
            let policy = RetryPolicy::default()
                .with_maximum_attempts(3)
                .with_initial_interval(Duration::from_millis(50));
            let options = ActivityOptions::with_start_to_close(Duration::from_secs(2)).retry_policy(policy);
            ctx.execute_activity("flaky", Payload::Null, options).await
        })
        .register_activity_fn("flaky", {
            let attempts = attempts.clone();
            move |_ctx, _input: Payload| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<Payload, _>(Failure::application("Unavailable", "try later"))
                }
            }
        });
    let worker = start_worker(&service, registry);

    let handle = service
        .start_workflow("FlakyWorkflow", Payload::Null, StartWorkflowOptions::new("flaky", QUEUE))
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert!(matches!(
        err.failure().unwrap().kind,
        FailureKind::Activity {
            retry_state: RetryState::MaximumAttemptsReached,
            attempt: 3,
            ..
        }
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn execution_timeout_closes_sleeping_workflow() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let mut registry = ImplementationRegistry::new();
    registry.register_workflow_fn("Sleeper", |ctx: WorkflowContext, _input: Payload| async move {
        ctx.sleep(Duration::from_secs(3600)).await;
        Ok(Payload::Null)
    });
    let worker = start_worker(&service, registry);

    let handle = service
        .start_workflow(
            "Sleeper",
            Payload::Null,
            StartWorkflowOptions::new("sleeper", QUEUE).execution_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert!(err.failure().unwrap().is_timeout());
    assert_eq!(handle.describe().await.unwrap().status, WorkflowStatus::TimedOut);
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancellation_is_observed_by_logic() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let mut registry = ImplementationRegistry::new();
    registry.register_workflow_fn("Cancellable", |ctx: WorkflowContext, _input: Payload| async move {
        match select(ctx.sleep(Duration::from_secs(3600)), ctx.cancelled()).await {
            Either::Left(_) => Ok(serde_json::json!("slept")),
            Either::Right((reason, _)) => Err(Failure::cancelled(reason)),
        }
    });
    let worker = start_worker(&service, registry);

    let handle = service
        .start_workflow("Cancellable", Payload::Null, StartWorkflowOptions::new("cancellable", QUEUE))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel("no longer needed").await.unwrap();

    let err = handle.result().await.unwrap_err();
    assert!(err.failure().unwrap().is_cancelled());
    let info = handle.describe().await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Cancelled);
    assert!(info.cancel_requested);
    worker.shutdown().await;
}

#[tokio::test]
async fn cancel_request_reaches_running_activity() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));

    let mut registry = ImplementationRegistry::new();
    registry
        .register_workflow_fn("Cleanup", |ctx: WorkflowContext, _input: Payload| async move {
            let work = ctx.execute_activity(
                "long_running",
                Payload::Null,
                ActivityOptions::with_start_to_close(Duration::from_secs(300)),
            );
            let reason = ctx.cancelled().await;
            // the activity is still running here; wait for it to unwind
            if let Ok(result) = work.await {
                return Ok(result);
            }
            Err(Failure::cancelled(reason))
        })
        .register_activity_fn("long_running", {
            let started = started.clone();
            let stopped = stopped.clone();
            move |ctx: ActivityContext, _input: Payload| {
                let started = started.clone();
                let stopped = stopped.clone();
                async move {
                    started.store(true, Ordering::SeqCst);
                    ctx.cancelled().await;
                    stopped.store(true, Ordering::SeqCst);
                    Err(Failure::non_retryable("ActivityCancelled", "stopped on request"))
                }
            }
        });
    let worker = start_worker(&service, registry);

    let handle = service
        .start_workflow("Cleanup", Payload::Null, StartWorkflowOptions::new("cleanup", QUEUE))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    handle.cancel("no longer needed").await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.failure().unwrap().is_cancelled());
    assert!(stopped.load(Ordering::SeqCst));

    // the activity failed while the execution was still running
    let history = handle.history().await.unwrap();
    let names: Vec<&str> = history.events().iter().map(|e| e.kind.name()).collect();
    let failed_at = names.iter().position(|n| *n == "ActivityTaskFailed").unwrap();
    let cancelled_at = names.iter().position(|n| *n == "WorkflowExecutionCancelled").unwrap();
    assert!(failed_at < cancelled_at);
    worker.shutdown().await;
}

#[tokio::test]
async fn signals_unblock_waiting_workflow() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let mut registry = ImplementationRegistry::new();
    registry.register_workflow_fn("Gated", |ctx: WorkflowContext, _input: Payload| async move {
        let first = ctx.wait_signal("name").await;
        let second = ctx.wait_signal("name").await;
        Ok(serde_json::json!([first, second]))
    });
    let worker = start_worker(&service, registry);

    let handle = service
        .start_workflow("Gated", Payload::Null, StartWorkflowOptions::new("gated", QUEUE))
        .await
        .unwrap();
    handle.signal("name", serde_json::json!("a")).await.unwrap();
    handle.signal("name", serde_json::json!("b")).await.unwrap();

    assert_eq!(handle.result().await.unwrap(), serde_json::json!(["a", "b"]));
    worker.shutdown().await;
}

#[tokio::test]
async fn recovered_execution_resumes_without_repeating_activities() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let registry = |calls: Arc<AtomicU32>| {
        let mut registry = ImplementationRegistry::new();
        registry
            .register_workflow_fn("TwoStep", |ctx: WorkflowContext, input: Payload| async move {
                let greeting = ctx
                    .execute_activity(
                        "greet",
                        encode(&("Hello", decode::<String>(&input)?))?,
                        ActivityOptions::with_start_to_close(Duration::from_secs(2)),
                    )
                    .await?;
                let suffix = ctx.wait_signal("go").await;
                encode(&format!("{}{}", decode::<String>(&greeting)?, decode::<String>(&suffix)?))
            })
            .register_activity_fn("greet", move |_ctx, input: Payload| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let (greeting, name): (String, String) = decode(&input)?;
                    encode(&format!("{} {}!", greeting, name))
                }
            });
        registry
    };

    {
        let store: Arc<dyn HistoryStore> = Arc::new(FileHistoryStore::new(dir.path().to_path_buf()).unwrap());
        let service = WorkflowService::with_store(EngineConfig::testing(), store).unwrap();
        let worker = start_worker(&service, registry(calls.clone()));
        let handle = service
            .start_workflow("TwoStep", encode("World").unwrap(), StartWorkflowOptions::new("two-step", QUEUE))
            .await
            .unwrap();

        // wait until the activity result has been processed by a workflow task
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let history = handle.history().await.unwrap();
                let events = history.events();
                let processed = events
                    .iter()
                    .position(|e| matches!(e.kind, EventKind::ActivityTaskCompleted { .. }))
                    .map(|at| {
                        events[at..]
                            .iter()
                            .any(|e| matches!(e.kind, EventKind::WorkflowTaskCompleted { .. }))
                    })
                    .unwrap_or(false);
                if processed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        worker.shutdown().await;
    }

    let store: Arc<dyn HistoryStore> = Arc::new(FileHistoryStore::new(dir.path().to_path_buf()).unwrap());
    let service = WorkflowService::with_store(EngineConfig::testing(), store).unwrap();
    let worker = start_worker(&service, registry(calls.clone()));
    let workflow_id = WorkflowId::new("two-step");
    assert_eq!(service.describe(&workflow_id).await.unwrap().status, WorkflowStatus::Running);

    service
        .signal_workflow(&workflow_id, "go", encode(" Welcome back").unwrap())
        .await
        .unwrap();
    assert_eq!(
        service.get_result(&workflow_id).await.unwrap(),
        serde_json::json!("Hello World! Welcome back")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    worker.shutdown().await;
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let service = WorkflowService::new(EngineConfig::testing()).unwrap();
    let mut events = service.subscribe();
    let worker = start_worker(&service, greeting_registry(Arc::new(AtomicU32::new(0))));

    let handle = service
        .start_workflow(
            "GreetingWorkflow",
            encode("World").unwrap(),
            StartWorkflowOptions::new("HelloActivityWorkflow", QUEUE),
        )
        .await
        .unwrap();
    handle.result().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen
        .iter()
        .any(|e| matches!(e, workflow_engine::ExecutionEvent::ActivityCompleted { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        workflow_engine::ExecutionEvent::WorkflowClosed {
            status: WorkflowStatus::Completed,
            ..
        }
    )));
    worker.shutdown().await;
}
