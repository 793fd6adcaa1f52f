//! End-to-end pipeline tests over the in-memory store and broker.
//!
//! These drive the real services (resource manager, worker runtimes,
//! sweeper) and assert the externally observable guarantees: exclusion,
//! placement collapse, release cleanup, cancellation interlocks, and
//! worker-death recovery.

mod common;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use common::{Gates, TestHarness};
use dispatch_core::broker::ControlEvent;
use dispatch_core::dispatch::{cancel, DispatchOptions, JobRegistry, SharedJobRegistry};
use dispatch_core::store::{TaskState, WorkerRegistry};
use dispatch_core::{DispatchError, JobArgs, TaskResult};

/// Registry with an `echo` job and a `gated` job that parks until the test
/// opens its named gate.
fn test_registry(gates: &Gates) -> SharedJobRegistry {
    let mut registry = JobRegistry::new();

    registry.register("echo", |args, _task, _ctx| async move {
        Ok(TaskResult {
            result: args.args.into_iter().next(),
            ..TaskResult::default()
        })
    });

    let gates = gates.clone();
    registry.register("gated", move |args, _task, _ctx| {
        let gates = gates.clone();
        async move {
            let gate = args
                .kwarg("gate")
                .and_then(|v| v.as_str())
                .unwrap_or("default")
                .to_string();
            let semaphore = gates.get(&gate);
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| DispatchError::Other(anyhow::anyhow!(e)))?;
            permit.forget();
            Ok(TaskResult::value("released"))
        }
    });

    Arc::new(registry)
}

fn gated_args(gate: &str) -> JobArgs {
    JobArgs::new().with_kwarg("gate", gate)
}

#[tokio::test]
async fn single_reservation_happy_path() {
    let gates = Gates::new();
    let registry = test_registry(&gates);
    let mut harness = TestHarness::new();
    harness.start_resource_manager();
    harness.start_worker("w1", registry.clone()).await;
    harness.start_worker("w2", registry).await;

    let handle = harness
        .client
        .apply_async_with_reservation(
            "echo",
            "repository",
            "a",
            JobArgs::positional(vec!["payload".into()]),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    let status = harness.wait_for_state(handle.task_id, TaskState::Finished).await;
    let worker = status.worker_name.clone().unwrap();
    assert!(worker == "w1" || worker == "w2");
    assert_eq!(status.result, Some(serde_json::json!("payload")));
    assert!(status.start_time.is_some());
    assert!(status.finish_time.is_some());

    // The trailing release clears the ledger.
    harness
        .wait_until("ledger empty after release", |store| {
            store.reservation_rows().is_empty()
        })
        .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn work_on_a_held_resource_collapses_onto_the_holder() {
    let gates = Gates::new();
    let registry = test_registry(&gates);
    let mut harness = TestHarness::new();
    harness.start_resource_manager();
    harness.start_worker("w1", registry.clone()).await;
    harness.start_worker("w2", registry).await;

    // First job parks holding repository:a on whichever worker it lands on.
    let first = harness
        .client
        .apply_async_with_reservation(
            "gated",
            "repository",
            "a",
            gated_args("first"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();
    let first_status = harness.wait_for_state(first.task_id, TaskState::Running).await;
    let holder = first_status.worker_name.clone().unwrap();
    let idle = if holder == "w1" { "w2" } else { "w1" };

    // Second job on the same resource must land on the holder, not the idle
    // worker.
    let second = harness
        .client
        .apply_async_with_reservation(
            "echo",
            "repository",
            "a",
            JobArgs::new(),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    let second_id = second.task_id;
    let expected_holder = holder.clone();
    harness
        .wait_until("second task reserved on the holder", move |store| {
            store
                .reservation_rows()
                .iter()
                .any(|r| r.task_id == second_id && r.worker_name == expected_holder)
        })
        .await;
    assert!(!harness.broker.was_published_to(idle));

    // The holder finishes its first job, then runs the second in order.
    gates.open("first");
    let first_final = harness.wait_for_state(first.task_id, TaskState::Finished).await;
    assert_eq!(first_final.worker_name.as_deref(), Some(holder.as_str()));
    let second_final = harness.wait_for_state(second.task_id, TaskState::Finished).await;
    assert_eq!(second_final.worker_name.as_deref(), Some(holder.as_str()));

    harness.shutdown().await;
}

#[tokio::test]
async fn multi_resource_request_waits_out_conflicting_holders() {
    let gates = Gates::new();
    let registry = test_registry(&gates);
    let mut harness = TestHarness::new();
    harness.start_resource_manager();

    // Start workers one at a time so each single-resource job lands
    // deterministically.
    harness.start_worker("w1", registry.clone()).await;
    let first = harness
        .client
        .apply_async_with_reservation(
            "gated",
            "repository",
            "a",
            gated_args("first"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();
    harness.wait_for_state(first.task_id, TaskState::Running).await;

    harness.start_worker("w2", registry).await;
    let second = harness
        .client
        .apply_async_with_reservation(
            "gated",
            "repository",
            "b",
            gated_args("second"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();
    harness.wait_for_state(second.task_id, TaskState::Running).await;

    // Two different workers now hold subsets of [a, b]; the request cannot
    // be served and parks.
    let third = harness
        .client
        .apply_async_with_reservation_list(
            "gated",
            &[("repository", "a"), ("repository", "b")],
            gated_args("third"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let parked = harness.task(third.task_id).await;
    assert_eq!(parked.state, TaskState::Waiting);
    assert!(!harness
        .store
        .reservation_rows()
        .iter()
        .any(|r| r.task_id == third.task_id));

    // Releasing one holder leaves a single holder; the request lands there.
    gates.open("first");
    harness.wait_for_state(first.task_id, TaskState::Finished).await;

    let third_id = third.task_id;
    harness
        .wait_until("multi request reserved on remaining holder", move |store| {
            let rows: Vec<_> = store
                .reservation_rows()
                .into_iter()
                .filter(|r| r.task_id == third_id)
                .collect();
            rows.len() == 2 && rows.iter().all(|r| r.worker_name == "w2")
        })
        .await;

    gates.open("second");
    harness.wait_for_state(second.task_id, TaskState::Finished).await;
    gates.open("third");
    harness.wait_for_state(third.task_id, TaskState::Finished).await;

    harness
        .wait_until("ledger empty at the end", |store| {
            store.reservation_rows().is_empty()
        })
        .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn cancel_running_task_survives_the_failure_hook() {
    let gates = Gates::new();
    let registry = test_registry(&gates);
    let mut harness = TestHarness::new();
    harness.start_resource_manager();
    harness.start_worker("w1", registry).await;

    let handle = harness
        .client
        .apply_async_with_reservation(
            "gated",
            "repository",
            "a",
            gated_args("stuck"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();
    harness.wait_for_state(handle.task_id, TaskState::Running).await;

    cancel(&harness.ctx, handle.task_id, true).await.unwrap();

    // The broker was asked to terminate the running execution.
    assert!(harness
        .broker
        .notified_events()
        .iter()
        .any(|e| matches!(e, ControlEvent::Revoke { task_id } if *task_id == handle.task_id)));

    // The revoked body fails, but the failure hook must not overwrite the
    // canceled state.
    let status = harness.wait_for_state(handle.task_id, TaskState::Canceled).await;
    assert_eq!(status.state, TaskState::Canceled);

    harness
        .wait_until("reservations cleared after revoked run", |store| {
            store.reservation_rows().is_empty()
        })
        .await;
    // Still canceled once the release has gone through.
    let final_status = harness.task(handle.task_id).await;
    assert_eq!(final_status.state, TaskState::Canceled);

    harness.shutdown().await;
}

#[tokio::test]
async fn dead_worker_is_swept_and_its_task_canceled() {
    let gates = Gates::new();
    let registry = test_registry(&gates);
    let mut harness = TestHarness::new();
    harness.start_resource_manager();
    harness.start_worker("w1", registry).await;

    let handle = harness
        .client
        .apply_async_with_reservation(
            "gated",
            "repository",
            "a",
            gated_args("doomed"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();
    harness.wait_for_state(handle.task_id, TaskState::Running).await;

    // The worker stops heartbeating (simulated by backdating) and the
    // sweeper declares it gone.
    harness
        .store
        .record_heartbeat("w1", Utc::now() - chrono::Duration::seconds(600))
        .await
        .unwrap();
    harness.start_sweeper(
        std::time::Duration::from_millis(100),
        std::time::Duration::from_millis(50),
    );

    harness
        .wait_until("worker evicted from the registry", |store| {
            !store.worker_rows().iter().any(|w| w.name == "w1")
        })
        .await;
    harness
        .wait_until("dead worker's reservations dropped", |store| {
            store.reservation_rows().is_empty()
        })
        .await;
    let status = harness.wait_for_state(handle.task_id, TaskState::Canceled).await;
    assert_eq!(status.worker_name.as_deref(), Some("w1"));

    // The parked body eventually returns; the canceled state must hold.
    gates.open("doomed");
    let task_id = handle.task_id;
    harness
        .wait_until("late success hook ran", move |store| {
            store
                .task_rows()
                .iter()
                .any(|t| t.task_id == task_id && t.finish_time.is_some())
        })
        .await;
    let final_status = harness.task(handle.task_id).await;
    assert_eq!(final_status.state, TaskState::Canceled);

    harness.shutdown().await;
}

#[tokio::test]
async fn cancel_unknown_task_is_a_missing_resource_error() {
    let harness = TestHarness::new();

    let err = cancel(&harness.ctx, Uuid::new_v4(), true).await.unwrap_err();
    assert!(matches!(err, DispatchError::MissingTask(_)));
    assert!(harness.store.task_rows().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn exclusion_holds_for_overlapping_resource_sets() {
    let gates = Gates::new();
    let registry = test_registry(&gates);
    let mut harness = TestHarness::new();
    harness.start_resource_manager();
    harness.start_worker("w1", registry.clone()).await;
    harness.start_worker("w2", registry).await;

    // Two jobs over the same resource: the second may be reserved onto the
    // holder but must not run while the first still does.
    let first = harness
        .client
        .apply_async_with_reservation(
            "gated",
            "repository",
            "a",
            gated_args("one"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();
    harness.wait_for_state(first.task_id, TaskState::Running).await;

    let second = harness
        .client
        .apply_async_with_reservation(
            "gated",
            "repository",
            "a",
            gated_args("two"),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    // Never two simultaneously running claimants of repository:a.
    let second_status = harness.task(second.task_id).await;
    assert_eq!(second_status.state, TaskState::Waiting);

    gates.open("one");
    harness.wait_for_state(first.task_id, TaskState::Finished).await;
    harness.wait_for_state(second.task_id, TaskState::Running).await;
    gates.open("two");
    harness.wait_for_state(second.task_id, TaskState::Finished).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn producer_surfaces_broker_failure_and_errors_the_task() {
    use anyhow::anyhow;
    use async_trait::async_trait;
    use bytes::Bytes;
    use dispatch_core::broker::{Broker, Delivery};
    use dispatch_core::dispatch::{DispatchClient, DispatcherContext};
    use dispatch_core::store::MemoryStore;
    use futures::stream::BoxStream;

    struct DownBroker;

    #[async_trait]
    impl Broker for DownBroker {
        async fn publish(&self, _queue: &str, _payload: Bytes) -> anyhow::Result<()> {
            Err(anyhow!("broker unavailable"))
        }

        async fn consume(&self, _queue: &str) -> anyhow::Result<BoxStream<'static, Delivery>> {
            Err(anyhow!("broker unavailable"))
        }

        async fn notify(&self, _event: ControlEvent) -> anyhow::Result<()> {
            Err(anyhow!("broker unavailable"))
        }

        async fn control_events(&self) -> anyhow::Result<BoxStream<'static, ControlEvent>> {
            Err(anyhow!("broker unavailable"))
        }
    }

    let store = Arc::new(MemoryStore::new());
    let ctx = Arc::new(DispatcherContext::from_store(
        store.clone(),
        Arc::new(DownBroker),
    ));
    let client = DispatchClient::new(ctx);

    let err = client
        .apply_async_with_reservation(
            "echo",
            "repository",
            "a",
            JobArgs::new(),
            DispatchOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("broker unavailable"));

    // The placeholder status row is flipped to error.
    let rows = store.task_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, TaskState::Error);
}
