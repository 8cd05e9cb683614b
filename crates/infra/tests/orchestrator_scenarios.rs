//! End-to-end attempt cycles against the in-memory store.

mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde_json::json;

use agentops_access::{
    AgentInstance, BillingPeriod, Entitlement, EntitlementStatus, PermissionRecord,
};
use agentops_agents::{
    AgentExecutor, AgentJob, ExecutionResult, ExecutorError, ExecutorRegistry, ScriptedExecutor,
    ScriptedOutcome, Usage,
};
use agentops_core::{Clock, ManualClock, WorkspaceId};
use agentops_infra::{
    InMemoryStore, Orchestrator, OrchestratorConfig, OrchestratorStore, QueueStatus, RetryPolicy,
    RunOutcome, RunStatus, Severity,
};

use support::{Fixture, Race, RacingStore, runner, start};

fn racing_orchestrator(
    fx: &Fixture,
    race: Race,
    executor: Arc<ScriptedExecutor>,
) -> Orchestrator<Arc<RacingStore>, ScriptedExecutor> {
    let store = Arc::new(RacingStore {
        inner: Arc::clone(&fx.store),
        rival: runner("other-runner"),
        race,
    });
    Orchestrator::new(store, executor, OrchestratorConfig::new(runner("runner-a")))
        .with_clock(fx.clock.clone())
}

#[tokio::test]
async fn happy_path_succeeds_and_records_one_run() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({ "lead": "ada" })).await;
    let executor = Arc::new(ScriptedExecutor::new(ScriptedOutcome::Succeed {
        output: Some(json!({ "draft": "Hi Ada" })),
        usage: Usage::new(120, 30, 0.0021),
    }));
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Succeeded { queue_item_id, run_id } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(queue_item_id, item.id);

    let item = fx.item(item.id).await;
    assert_eq!(item.status, QueueStatus::Succeeded);
    assert_eq!(item.locked_by, None);
    assert_eq!(item.locked_at, None);
    assert_eq!(item.attempts, 0);

    let runs = fx.store.list_runs_for_queue_item(item.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.id, run_id);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.input, json!({ "lead": "ada" }));
    assert_eq!(run.output, Some(json!({ "draft": "Hi Ada" })));
    assert_eq!(run.usage.map(|u| u.total_tokens), Some(150));
    assert_eq!(run.runner_id.as_str(), "runner-a");
    assert_eq!(run.started_at, start());
    assert_eq!(run.duration_ms, Some(0));

    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].attempt, 1);
    assert_eq!(calls[0].max_attempts, 3);

    let events = fx.store.system_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "agent_run_succeeded");
    assert!(events[0].ok);
    assert_eq!(events[0].data["run_id"], json!(run_id));
}

#[tokio::test]
async fn empty_queue_is_idle() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::echo()));
    assert_eq!(orchestrator.run_once().await.unwrap(), RunOutcome::Idle);
}

#[tokio::test]
async fn future_items_are_not_eligible_yet() {
    let fx = Fixture::new();
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());
    fx.store
        .enqueue_queue_item(
            fx.new_item("follow_up.draft", json!({}))
                .scheduled_at(start() + ChronoDuration::seconds(5)),
            start(),
        )
        .await
        .unwrap();

    assert_eq!(orchestrator.run_once().await.unwrap(), RunOutcome::Idle);

    fx.clock.advance(Duration::from_secs(5));
    assert!(matches!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Succeeded { .. }
    ));
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn losing_the_lock_race_is_contended_and_leaves_the_item_alone() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = racing_orchestrator(&fx, Race::AfterFetch, executor.clone());

    assert_eq!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Contended {
            queue_item_id: item.id
        }
    );
    assert_eq!(executor.call_count(), 0);

    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Locked);
    assert_eq!(after.locked_by, Some(runner("other-runner")));
    assert_eq!(after.locked_at, Some(start()));
    assert_eq!(after.attempts, 0);
    assert!(fx.store.runs().is_empty());
    assert!(fx.store.system_events().is_empty());
}

#[tokio::test]
async fn fresh_foreign_lock_cannot_be_taken() {
    let fx = Fixture::new();
    let item = fx.insert(|item| {
        item.status = QueueStatus::Locked;
        item.locked_by = Some(runner("other-runner"));
        item.locked_at = Some(start() - ChronoDuration::seconds(10));
    });
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::echo()));

    assert_eq!(orchestrator.run_once().await.unwrap(), RunOutcome::Idle);
    assert!(
        !fx.store
            .lock_queue_item(item.id, &runner("runner-a"), start())
            .await
            .unwrap()
    );
    assert_eq!(fx.item(item.id).await, item);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_runners_execute_an_item_once() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let executor = Arc::new(ScriptedExecutor::new(ScriptedOutcome::delayed(
        Duration::from_millis(50),
        ScriptedOutcome::Echo,
    )));

    let mut handles = Vec::new();
    for i in 0..4 {
        let orchestrator = Arc::new(fx.orchestrator(&format!("runner-{i}"), executor.clone()));
        handles.push(tokio::spawn(async move { orchestrator.run_once().await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            RunOutcome::Succeeded { .. } => succeeded += 1,
            RunOutcome::Idle | RunOutcome::Contended { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(executor.call_count(), 1);
    assert_eq!(fx.item(item.id).await.status, QueueStatus::Succeeded);
    assert_eq!(fx.store.runs().len(), 1);
}

#[tokio::test]
async fn failed_attempt_is_retried_with_backoff() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let orchestrator = fx.orchestrator(
        "runner-a",
        Arc::new(ScriptedExecutor::always_failing("crm_unreachable")),
    );

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { run_id, error, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(run_id.is_some());
    assert_eq!(error.code, "crm_unreachable");

    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Queued);
    assert_eq!(after.attempts, 1);
    assert_eq!(after.scheduled_at, item.scheduled_at + ChronoDuration::milliseconds(1000));
    assert_eq!(after.last_error.as_ref().map(|e| e.code.as_str()), Some("crm_unreachable"));
    assert_eq!(after.locked_by, None);

    let runs = fx.store.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].error.as_ref().map(|e| e.code.as_str()), Some("crm_unreachable"));

    let events = fx.store.system_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "agent_run_failed");
    assert!(!events[0].ok);
    assert_eq!(events[0].data["attempts"], json!(1));
    assert_eq!(events[0].data["retriable"], json!(true));

    // Not eligible again until the backoff elapses.
    assert_eq!(orchestrator.run_once().await.unwrap(), RunOutcome::Idle);
    fx.clock.advance(Duration::from_millis(1000));
    assert!(matches!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Failed { .. }
    ));

    let after = fx.item(item.id).await;
    assert_eq!(after.attempts, 2);
    assert_eq!(
        after.scheduled_at,
        item.scheduled_at + ChronoDuration::milliseconds(1000 + 2000)
    );
}

#[tokio::test]
async fn final_attempt_failure_is_terminal() {
    let fx = Fixture::new();
    let item = fx.insert(|item| item.attempts = 2);
    let executor = Arc::new(ScriptedExecutor::always_failing("draft_rejected"));
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    assert!(matches!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Failed { .. }
    ));
    assert!(executor.calls()[0].is_final_attempt());

    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Failed);
    assert_eq!(after.attempts, 3);
    assert_eq!(after.scheduled_at, item.scheduled_at);
    assert_eq!(after.locked_by, None);

    fx.clock.advance(Duration::from_secs(3600));
    assert_eq!(orchestrator.run_once().await.unwrap(), RunOutcome::Idle);
    assert_eq!(fx.item(item.id).await.status, QueueStatus::Failed);
}

#[tokio::test]
async fn missing_agent_fails_the_attempt_without_a_run() {
    let fx = Fixture::new();
    let item = fx.insert(|item| item.agent_instance_id = agentops_core::AgentInstanceId::new());
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    let outcome = orchestrator.run_once().await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Failed {
            queue_item_id: item.id,
            run_id: None,
            error: agentops_infra::ErrorDetail::new("agent_not_found", "agent instance not found"),
        }
    );
    assert_eq!(executor.call_count(), 0);
    assert!(fx.store.runs().is_empty());

    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Queued);
    assert_eq!(after.attempts, 1);
    assert_eq!(after.locked_by, None);

    let events = fx.store.system_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "agent_run_failed");
    assert_eq!(events[0].data["run_id"], json!(null));
}

#[tokio::test]
async fn inactive_entitlement_fails_gating() {
    let fx = Fixture::new();
    fx.store
        .insert_entitlement(
            Entitlement::active(
                fx.workspace_id,
                "growth",
                BillingPeriod {
                    starts_at: start() - ChronoDuration::days(40),
                    ends_at: start() - ChronoDuration::days(10),
                },
            )
            .with_status(EntitlementStatus::PastDue),
        )
        .unwrap();
    fx.enqueue("follow_up.draft", json!({})).await;
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, run_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "entitlements_missing");
    assert_eq!(run_id, None);
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn missing_permission_record_fails_gating() {
    let fx = Fixture::new();
    // A second agent in the same workspace, without a permission record.
    let agent = AgentInstance::new(fx.workspace_id, "sales.follow_up");
    fx.store.insert_agent_instance(agent.clone()).unwrap();
    fx.insert(|item| item.agent_instance_id = agent.id);
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "permissions_missing");
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn job_cannot_borrow_an_agent_from_an_entitled_workspace() {
    let fx = Fixture::new();
    // The item's own workspace has no entitlement; the agent it names belongs
    // to the fixture's entitled workspace.
    let item = fx.insert(|item| item.workspace_id = WorkspaceId::new());
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, run_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "agent_not_found");
    assert_eq!(run_id, None);
    assert_eq!(executor.call_count(), 0);
    assert!(fx.store.runs().is_empty());

    let after = fx.item(item.id).await;
    assert_eq!(after.attempts, 1);
    assert_eq!(after.locked_by, None);
}

#[tokio::test]
async fn entitlement_is_checked_for_the_jobs_own_workspace() {
    let fx = Fixture::new();
    // A second workspace with an agent and permissions but no plan.
    let unentitled = WorkspaceId::new();
    let agent = AgentInstance::new(unentitled, "sales.follow_up");
    fx.store.insert_agent_instance(agent.clone()).unwrap();
    fx.store
        .insert_permission_record(PermissionRecord::new(agent.id, unentitled))
        .unwrap();
    fx.insert(|item| {
        item.workspace_id = unentitled;
        item.agent_instance_id = agent.id;
    });
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "entitlements_missing");
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn executor_fault_is_reported_and_counted() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let executor = Arc::new(ScriptedExecutor::new(ScriptedOutcome::Fault(
        ExecutorError::Transport("connection reset".into()),
    )));
    let orchestrator = fx.orchestrator("runner-a", executor);

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, run_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "executor_error");
    assert!(error.message.contains("connection reset"));

    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Queued);
    assert_eq!(after.attempts, 1);
    assert_eq!(after.locked_by, None);

    let run = fx.store.get_agent_run(run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let reports = fx.store.error_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].source, "orchestrator.run_once");
    assert_eq!(reports[0].environment, "test");
    assert_eq!(reports[0].severity, Severity::Error);
    assert_eq!(reports[0].context["code"], json!("executor_error"));
    let stack = reports[0].stack.as_deref().unwrap();
    assert!(stack.contains("Transport(\"connection reset\")"), "{stack}");
}

#[tokio::test]
async fn executor_panic_is_contained() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let executor = Arc::new(
        ScriptedExecutor::echo().then(ScriptedOutcome::Panic("model adapter exploded".into())),
    );
    let orchestrator = fx.orchestrator("runner-a", executor);

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "executor_panicked");
    assert!(error.message.contains("model adapter exploded"));

    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Queued);
    assert_eq!(after.locked_by, None);
    assert_eq!(fx.store.runs()[0].status, RunStatus::Failed);
    let report = &fx.store.error_reports()[0];
    assert_eq!(report.severity, Severity::Critical);
    assert_eq!(
        report.stack.as_deref(),
        Some("executor task panicked: model adapter exploded")
    );

    // The next attempt runs normally once the backoff has passed.
    fx.clock.advance(Duration::from_secs(1));
    assert!(matches!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Succeeded { .. }
    ));
}

#[tokio::test]
async fn store_fault_after_lock_becomes_a_failed_attempt() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());
    fx.store.fail_next("create_agent_run");

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, run_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "store_error");
    assert_eq!(run_id, None);
    assert_eq!(executor.call_count(), 0);

    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Queued);
    assert_eq!(after.attempts, 1);
    assert_eq!(after.locked_by, None);
    let reports = fx.store.error_reports();
    assert_eq!(reports.len(), 1);
    let stack = reports[0].stack.as_deref().unwrap();
    assert!(stack.starts_with("Storage("), "{stack}");
    assert!(stack.contains("create_agent_run"), "{stack}");
}

#[tokio::test]
async fn gate_lookup_fault_becomes_a_failed_attempt() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::echo()));
    fx.store.fail_next("get_active_entitlement");

    let outcome = orchestrator.run_once().await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Failed { ref error, .. } if error.code == "store_error"
    ));
    assert_eq!(fx.item(item.id).await.attempts, 1);
}

#[tokio::test]
async fn fetch_and_lock_faults_escape_run_once() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::echo()));

    fx.store.fail_next("fetch_next_queue_item");
    assert!(orchestrator.run_once().await.is_err());

    fx.store.fail_next("lock_queue_item");
    assert!(orchestrator.run_once().await.is_err());

    let untouched = fx.item(item.id).await;
    assert_eq!(untouched.status, QueueStatus::Queued);
    assert_eq!(untouched.attempts, 0);
    assert!(fx.store.error_reports().is_empty());
}

#[tokio::test]
async fn result_marking_fault_still_releases_the_lock() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::echo()));
    fx.store.fail_next("mark_queue_item_result");

    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, run_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "store_error");

    // Recovery re-marks the item as a failed attempt and closes the run.
    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Queued);
    assert_eq!(after.attempts, 1);
    assert_eq!(after.locked_by, None);
    let run = fx.store.get_agent_run(run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn event_recording_failures_do_not_change_the_outcome() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::echo()));
    fx.store.fail_next("record_system_event");

    assert!(matches!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Succeeded { .. }
    ));
    assert_eq!(fx.item(item.id).await.status, QueueStatus::Succeeded);
    assert!(fx.store.system_events().is_empty());
}

#[tokio::test]
async fn expired_foreign_lease_is_reclaimed() {
    let fx = Fixture::new();
    let item = fx.insert(|item| {
        item.status = QueueStatus::Running;
        item.locked_by = Some(runner("crashed-runner"));
        item.locked_at = Some(start() - ChronoDuration::milliseconds(300_000));
    });
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::echo()));

    // Held items are never fetched; the sweep returns them to the queue.
    assert_eq!(orchestrator.run_once().await.unwrap(), RunOutcome::Idle);
    assert_eq!(orchestrator.sweep_expired_leases().await.unwrap(), 1);

    let requeued = fx.item(item.id).await;
    assert_eq!(requeued.status, QueueStatus::Queued);
    assert_eq!(requeued.attempts, 0);
    assert_eq!(
        requeued.last_error.as_ref().map(|e| e.code.as_str()),
        Some("lease_expired")
    );

    assert!(matches!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Succeeded { .. }
    ));
    assert!(
        fx.store
            .system_events()
            .iter()
            .any(|e| e.event_type == "queue_leases_requeued")
    );
}

#[tokio::test]
async fn expired_foreign_lock_can_be_taken_directly() {
    let fx = Fixture::new();
    let item = fx.insert(|item| {
        item.status = QueueStatus::Locked;
        item.locked_by = Some(runner("crashed-runner"));
        item.locked_at = Some(start() - ChronoDuration::milliseconds(299_999));
    });
    let me = runner("runner-a");

    assert!(!fx.store.lock_queue_item(item.id, &me, start()).await.unwrap());
    fx.clock.advance(Duration::from_millis(1));
    assert!(
        fx.store
            .lock_queue_item(item.id, &me, fx.clock.now())
            .await
            .unwrap()
    );
    assert_eq!(fx.item(item.id).await.locked_by, Some(me));
}

#[tokio::test]
async fn lock_lost_before_start_is_skipped() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = racing_orchestrator(&fx, Race::BeforeStart, executor.clone());

    assert_eq!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Skipped {
            queue_item_id: item.id
        }
    );
    assert_eq!(executor.call_count(), 0);
    assert!(fx.store.runs().is_empty());

    // The new holder keeps its lock and no attempt was consumed.
    let after = fx.item(item.id).await;
    assert_eq!(after.status, QueueStatus::Locked);
    assert_eq!(after.locked_by, Some(runner("other-runner")));
    assert_eq!(after.attempts, 0);
}

#[tokio::test]
async fn canceled_items_are_never_executed() {
    let fx = Fixture::new();
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    assert!(fx.store.cancel_queue_item(item.id, start()).await.unwrap());

    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());
    assert_eq!(orchestrator.run_once().await.unwrap(), RunOutcome::Idle);
    assert_eq!(executor.call_count(), 0);
    assert_eq!(fx.store.queue_stats().await.unwrap().canceled, 1);
}

#[tokio::test]
async fn higher_priority_runs_first() {
    let fx = Fixture::new();
    let low = fx.enqueue("digest.weekly", json!({ "n": 1 })).await;
    let high = fx
        .store
        .enqueue_queue_item(
            fx.new_item("lead.reply", json!({ "n": 2 })).with_priority(10),
            start(),
        )
        .await
        .unwrap();
    let executor = Arc::new(ScriptedExecutor::echo());
    let orchestrator = fx.orchestrator("runner-a", executor.clone());

    orchestrator.run_once().await.unwrap();
    orchestrator.run_once().await.unwrap();

    let order: Vec<_> = executor.calls().iter().map(|j| j.queue_item_id).collect();
    assert_eq!(order, vec![high.id, low.id]);
}

#[tokio::test]
async fn custom_retry_policy_is_applied_by_the_store() {
    let fx = Fixture::with_store(
        InMemoryStore::new().with_retry_policy(RetryPolicy::fixed(Duration::from_secs(30))),
    );
    let item = fx.enqueue("follow_up.draft", json!({})).await;
    let orchestrator = fx.orchestrator("runner-a", Arc::new(ScriptedExecutor::always_failing("x")));

    orchestrator.run_once().await.unwrap();
    assert_eq!(
        fx.item(item.id).await.scheduled_at,
        item.scheduled_at + ChronoDuration::seconds(30)
    );
}

#[tokio::test]
async fn registry_routes_by_agent_type() {
    let fx = Fixture::with_agent_type(InMemoryStore::new(), "sales.follow_up");
    let sales = Arc::new(ScriptedExecutor::echo());
    let registry = ExecutorRegistry::new().with("sales.*", sales.clone());
    let orchestrator = fx.orchestrator("runner-a", Arc::new(registry));

    fx.enqueue("follow_up.draft", json!({})).await;
    assert!(matches!(
        orchestrator.run_once().await.unwrap(),
        RunOutcome::Succeeded { .. }
    ));
    assert_eq!(sales.call_count(), 1);
}

#[tokio::test]
async fn unrouted_agent_type_fails_with_no_executor() {
    let fx = Fixture::with_agent_type(InMemoryStore::new(), "support.triage");
    let registry = ExecutorRegistry::new().with("sales.*", Arc::new(ScriptedExecutor::echo()));
    let orchestrator = fx.orchestrator("runner-a", Arc::new(registry));

    fx.enqueue("ticket.classify", json!({})).await;
    let outcome = orchestrator.run_once().await.unwrap();
    let RunOutcome::Failed { error, run_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code, "no_executor");
    assert!(run_id.is_some());
}

/// Advances the shared clock, then sleeps past one heartbeat and reports the
/// lease timestamp it observes.
struct LeaseWatcher {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
}

#[async_trait]
impl AgentExecutor for LeaseWatcher {
    async fn execute(
        &self,
        job: &AgentJob,
        _agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let item = self
            .store
            .get_queue_item(job.queue_item_id)
            .await
            .map_err(|e| ExecutorError::Internal(e.to_string()))?
            .ok_or_else(|| ExecutorError::Internal("item vanished".into()))?;
        Ok(ExecutionResult::succeeded(
            Some(json!({ "locked_at": item.locked_at })),
            Usage::default(),
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_renews_the_lease_while_executing() {
    let fx = Fixture::new();
    fx.enqueue("follow_up.draft", json!({})).await;
    let watcher = Arc::new(LeaseWatcher {
        store: Arc::clone(&fx.store),
        clock: fx.clock.clone(),
    });
    let orchestrator = Orchestrator::new(
        Arc::clone(&fx.store),
        watcher,
        OrchestratorConfig::new(runner("runner-a")).with_heartbeat(Duration::from_secs(1)),
    )
    .with_clock(fx.clock.clone());

    orchestrator.run_once().await.unwrap();

    let run = &fx.store.runs()[0];
    let renewed = start() + ChronoDuration::seconds(1);
    assert_eq!(run.output, Some(json!({ "locked_at": renewed })));
}

#[tokio::test(start_paused = true)]
async fn without_heartbeat_the_lease_is_not_renewed() {
    let fx = Fixture::new();
    fx.enqueue("follow_up.draft", json!({})).await;
    let watcher = Arc::new(LeaseWatcher {
        store: Arc::clone(&fx.store),
        clock: fx.clock.clone(),
    });
    let orchestrator = fx.orchestrator("runner-a", watcher);

    orchestrator.run_once().await.unwrap();

    let run = &fx.store.runs()[0];
    assert_eq!(run.output, Some(json!({ "locked_at": start() })));
}

#[tokio::test]
async fn lock_is_never_left_with_the_completing_runner() {
    let fx = Fixture::new();
    let executor = Arc::new(
        ScriptedExecutor::echo()
            .then(ScriptedOutcome::fail("x", "y"))
            .then(ScriptedOutcome::Panic("boom".into()))
            .then(ScriptedOutcome::Fault(ExecutorError::Timeout(10))),
    );
    let orchestrator = fx.orchestrator("runner-a", executor);
    let me = runner("runner-a");

    for i in 0..4 {
        fx.enqueue("follow_up.draft", json!({ "i": i })).await;
    }
    for _ in 0..4 {
        let outcome = orchestrator.run_once().await.unwrap();
        let id = outcome.queue_item_id().unwrap();
        assert_ne!(fx.item(id).await.locked_by.as_ref(), Some(&me));
    }
}
