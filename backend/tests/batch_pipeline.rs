mod common;

use crate::common::{
    coordinator, coordinator_with, eventually, seed_session, settings, FakeDelivery,
    FakeRenderer,
};
use ::common::jobs::{ErrorKind, Operation, StreamMessage, TaskState};
use ::common::model::session::SessionStatus;
use payroll_notifier::delivery::AttemptOutcome;
use payroll_notifier::error::PipelineError;
use payroll_notifier::job_controller::BatchSettings;
use payroll_notifier::render::RenderError;
use payroll_notifier::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn retried_render_still_delivers_everyone() {
    let store = Store::open_in_memory().unwrap();
    let (session, employees) = seed_session(&store, &["A", "B", "C"]);
    let renderer = Arc::new(FakeRenderer::new());
    renderer.fail("B", vec![RenderError::ConversionTimeout(Duration::from_secs(60))]);
    let delivery = Arc::new(FakeDelivery::new());
    let coord = coordinator(&store, renderer.clone(), Some(delivery.clone()), 2);

    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    let status = coord.wait_for_completion(session).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    let tasks = coord.tasks(session).await.unwrap();
    for task in &tasks {
        assert_eq!(task.state, TaskState::Delivered, "{}", task.employee_name);
        assert_eq!(task.delivery_attempts, 1);
        assert!(task.error.is_none());
    }
    assert_eq!(tasks[0].render_attempts, 1);
    assert_eq!(tasks[1].render_attempts, 2);
    assert_eq!(tasks[2].render_attempts, 1);

    let progress = coord.progress(session).await.unwrap();
    assert_eq!(progress.counts.delivered, 3);
    assert_eq!(progress.failed, 0);
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(delivery.calls(), 3);
    assert_eq!(renderer.calls_for("B"), 2);

    let history = coord.history(session).await.unwrap();
    let retry = history
        .iter()
        .find(|e| e.employee_id == employees[1].id && e.from == TaskState::Rendering)
        .unwrap();
    assert_eq!(retry.to, TaskState::Rendering);
    assert_eq!(retry.error.as_ref().unwrap().kind, ErrorKind::TransientExternal);

    let sent = delivery.sent.lock().unwrap();
    assert!(sent.iter().all(|p| p.image.starts_with("data:image/png;base64,")));
    assert!(sent.iter().all(|p| p.content == "Phiếu lương tháng 10"));

    let stored = store.session(session).unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(store.employees(session).unwrap().iter().all(|e| e.last_sent_at.is_some()));
}

#[tokio::test]
async fn pool_size_caps_concurrent_work() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A", "B", "C", "D", "E", "F"]);
    let renderer = Arc::new(FakeRenderer::with_delay(Duration::from_millis(30)));
    let mut delivery = FakeDelivery::new();
    delivery.delay = Duration::from_millis(20);
    let delivery = Arc::new(delivery);
    let coord = coordinator(&store, renderer.clone(), Some(delivery.clone()), 2);

    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();

    assert_eq!(renderer.calls(), 6);
    assert_eq!(delivery.calls(), 6);
    assert!(renderer.stats.peak() <= 2);
    assert!(delivery.stats.peak() <= 2);
    assert_eq!(coord.pool().peak(), 2);
    assert_eq!(coord.pool().active(), 0);
}

#[tokio::test]
async fn cancel_stops_all_unfinished_work() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A", "B", "C", "D"]);
    let renderer = Arc::new(FakeRenderer::new());
    renderer.hold("A");
    let delivery = Arc::new(FakeDelivery::new());
    let coord = coordinator(&store, renderer.clone(), Some(delivery.clone()), 1);

    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    eventually(|| renderer.calls() == 1).await;

    coord.cancel_batch(session).await.unwrap();
    let status = coord.wait_for_completion(session).await.unwrap();
    assert_eq!(status, SessionStatus::Cancelled);

    let tasks = coord.tasks(session).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Cancelled));
    let progress = coord.progress(session).await.unwrap();
    assert_eq!(progress.counts.cancelled, 4);
    assert_eq!(progress.total, 4);

    assert_eq!(renderer.calls(), 1);
    assert_eq!(delivery.calls(), 0);
    assert!(matches!(
        coord.cancel_batch(session).await,
        Err(PipelineError::NotRunning(_))
    ));
}

#[tokio::test]
async fn unchanged_rows_reuse_the_cached_slip() {
    let store = Store::open_in_memory().unwrap();
    let (session, employees) = seed_session(&store, &["A", "B"]);
    let renderer = Arc::new(FakeRenderer::new());
    let coord = coordinator(&store, renderer.clone(), None, 2);

    coord.start_batch(session, Operation::Generate).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();
    let first = coord.tasks(session).await.unwrap();
    assert_eq!(renderer.calls(), 2);
    assert!(first.iter().all(|t| t.state == TaskState::Rendered && !t.cache_hit));

    coord.start_batch(session, Operation::Generate).await.unwrap();
    assert_eq!(
        coord.wait_for_completion(session).await.unwrap(),
        SessionStatus::Completed
    );
    let second = coord.tasks(session).await.unwrap();
    assert_eq!(renderer.calls(), 2);
    for (a, b) in first.iter().zip(&second) {
        assert!(b.cache_hit);
        assert_eq!(b.render_attempts, 0);
        assert_eq!(a.slip_hash, b.slip_hash);
    }
    let slip = store.slip(employees[0].id).unwrap().unwrap();
    assert_eq!(Some(slip.content_hash), second[0].slip_hash);
}

#[tokio::test]
async fn second_start_while_running_conflicts() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A"]);
    let renderer = Arc::new(FakeRenderer::new());
    renderer.hold("A");
    let coord = coordinator(&store, renderer.clone(), None, 1);

    coord.start_batch(session, Operation::Generate).await.unwrap();
    let err = coord.start_batch(session, Operation::Generate).await.unwrap_err();
    assert!(matches!(err, PipelineError::Conflict(id) if id == session));

    renderer.open("A");
    coord.wait_for_completion(session).await.unwrap();
    coord.start_batch(session, Operation::Generate).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();

    assert!(matches!(
        coord.start_batch(Uuid::new_v4(), Operation::Generate).await,
        Err(PipelineError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn retry_requeues_only_failed_tasks() {
    let store = Store::open_in_memory().unwrap();
    let (session, employees) = seed_session(&store, &["A", "B", "C"]);
    let renderer = Arc::new(FakeRenderer::new());
    renderer.fail("B", vec![RenderError::Encoding("truncated PNG".into())]);
    let coord = coordinator(&store, renderer.clone(), None, 2);

    assert!(matches!(
        coord.retry_failed(session).await,
        Err(PipelineError::NothingToRetry(_))
    ));

    coord.start_batch(session, Operation::Generate).await.unwrap();
    assert_eq!(
        coord.wait_for_completion(session).await.unwrap(),
        SessionStatus::Completed
    );
    let tasks = coord.tasks(session).await.unwrap();
    assert_eq!(tasks[1].state, TaskState::RenderFailed);
    assert_eq!(tasks[1].render_attempts, 1);
    assert_eq!(tasks[1].error.as_ref().unwrap().kind, ErrorKind::PermanentExternal);
    assert_eq!(coord.progress(session).await.unwrap().failed, 1);

    coord.retry_failed(session).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();

    let tasks = coord.tasks(session).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Rendered));
    assert_eq!(tasks[1].attempt, 2);
    assert_eq!(tasks[0].attempt, 1);
    assert_eq!(renderer.calls_for("A"), 1);
    assert_eq!(renderer.calls_for("B"), 2);

    let history = coord.history(session).await.unwrap();
    assert!(history.iter().any(|e| e.employee_id == employees[1].id
        && e.from == TaskState::RenderFailed
        && e.to == TaskState::Queued
        && e.attempt == 2));
    assert!(matches!(
        coord.retry_failed(session).await,
        Err(PipelineError::NothingToRetry(_))
    ));
}

#[tokio::test]
async fn late_subscriber_sees_snapshot_then_remaining_events() {
    let store = Store::open_in_memory().unwrap();
    let (session, employees) = seed_session(&store, &["A", "B", "C", "D", "E"]);
    let renderer = Arc::new(FakeRenderer::new());
    for name in ["C", "D", "E"] {
        renderer.hold(name);
    }
    let coord = coordinator(&store, renderer.clone(), None, 5);

    coord.start_batch(session, Operation::Generate).await.unwrap();
    eventually(|| renderer.calls() == 5).await;
    for _ in 0..200 {
        let progress = coord.progress(session).await.unwrap();
        if progress.completed == 2 && progress.counts.rendering == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut sub = coord.subscribe(session).await.unwrap();
    match sub.recv().await {
        Some(StreamMessage::Snapshot { progress }) => {
            assert_eq!(progress.completed, 2);
            assert_eq!(progress.pending, 3);
            assert_eq!(progress.total, 5);
        }
        other => panic!("expected snapshot, got {:?}", other),
    }

    for name in ["C", "D", "E"] {
        renderer.open(name);
    }

    let mut seen = HashSet::new();
    loop {
        match sub.recv().await {
            Some(StreamMessage::Event { event, progress }) => {
                assert_eq!(event.to, TaskState::Rendered);
                assert_eq!(progress.total, 5);
                seen.insert(event.employee_id);
            }
            Some(StreamMessage::Closed { progress }) => {
                assert_eq!(progress.completed, 5);
                assert_eq!(progress.status, SessionStatus::Completed);
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    let expected: HashSet<Uuid> = employees[2..].iter().map(|e| e.id).collect();
    assert_eq!(seen, expected);
    assert!(sub.recv().await.is_none());
}

#[tokio::test]
async fn counts_cover_every_employee_throughout() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A", "B", "C", "D"]);
    let renderer = Arc::new(FakeRenderer::with_delay(Duration::from_millis(5)));
    renderer.fail("C", vec![RenderError::Template("missing values for: bank".into())]);
    let delivery = Arc::new(FakeDelivery::new());
    let coord = coordinator(&store, renderer.clone(), Some(delivery), 2);

    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    let mut sub = coord.subscribe(session).await.unwrap();
    let mut messages = 0;
    while let Some(message) = sub.recv().await {
        let progress = match message {
            StreamMessage::Snapshot { progress }
            | StreamMessage::Event { progress, .. }
            | StreamMessage::Closed { progress } => progress,
            StreamMessage::Heartbeat { .. } => continue,
        };
        assert_eq!(progress.total, 4);
        assert_eq!(progress.counts.total(), 4);
        assert_eq!(progress.completed + progress.failed + progress.pending, 4);
        messages += 1;
    }
    assert!(messages > 1);
    let progress = coord.progress(session).await.unwrap();
    assert_eq!(progress.counts.delivered, 3);
    assert_eq!(progress.counts.render_failed, 1);
}

#[tokio::test]
async fn ambiguous_delivery_is_not_resent() {
    let store = Store::open_in_memory().unwrap();
    let (session, employees) = seed_session(&store, &["A"]);
    let delivery = Arc::new(FakeDelivery::new());
    delivery.script(
        employees[0].phone.as_deref().unwrap(),
        vec![AttemptOutcome::Ambiguous {
            message: "timed out after dispatch".into(),
        }],
    );
    let coord = coordinator(&store, Arc::new(FakeRenderer::new()), Some(delivery.clone()), 1);

    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    assert_eq!(
        coord.wait_for_completion(session).await.unwrap(),
        SessionStatus::Failed
    );
    let task = &coord.tasks(session).await.unwrap()[0];
    assert_eq!(task.state, TaskState::DeliveryUnknown);
    assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::UnknownOutcome);
    assert_eq!(delivery.calls(), 1);

    let history = store.send_history(employees[0].id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "unknown");
}

#[tokio::test]
async fn transient_delivery_failures_are_retried() {
    let store = Store::open_in_memory().unwrap();
    let (session, employees) = seed_session(&store, &["A"]);
    let delivery = Arc::new(FakeDelivery::new());
    delivery.script(
        employees[0].phone.as_deref().unwrap(),
        vec![AttemptOutcome::Transient {
            message: "HTTP 503: busy".into(),
        }],
    );
    let coord = coordinator(&store, Arc::new(FakeRenderer::new()), Some(delivery.clone()), 1);

    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();

    let task = &coord.tasks(session).await.unwrap()[0];
    assert_eq!(task.state, TaskState::Delivered);
    assert_eq!(task.delivery_attempts, 2);
    assert_eq!(delivery.calls(), 2);
    let statuses: Vec<String> = store
        .send_history(employees[0].id)
        .unwrap()
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, ["retry", "success"]);
}

#[tokio::test]
async fn sending_without_webhook_or_contact_fails_fast() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A", "B"]);
    let coord = coordinator(&store, Arc::new(FakeRenderer::new()), None, 2);

    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    assert_eq!(
        coord.wait_for_completion(session).await.unwrap(),
        SessionStatus::Failed
    );
    for task in coord.tasks(session).await.unwrap() {
        assert_eq!(task.state, TaskState::DeliveryFailed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Configuration);
    }
}

#[tokio::test]
async fn send_only_uses_slips_from_an_earlier_run() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A", "B"]);
    let renderer = Arc::new(FakeRenderer::new());
    let delivery = Arc::new(FakeDelivery::new());
    let coord = coordinator(&store, renderer.clone(), Some(delivery.clone()), 2);

    coord.start_batch(session, Operation::Send).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();
    let tasks = coord.tasks(session).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::DeliveryFailed));
    assert_eq!(delivery.calls(), 0);

    coord.start_batch(session, Operation::Generate).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();
    coord.start_batch(session, Operation::Send).await.unwrap();
    assert_eq!(
        coord.wait_for_completion(session).await.unwrap(),
        SessionStatus::Completed
    );

    let tasks = coord.tasks(session).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Delivered && t.render_attempts == 0));
    assert_eq!(renderer.calls(), 2);
    assert_eq!(delivery.calls(), 2);
}

#[tokio::test]
async fn employee_without_phone_is_not_sent() {
    let store = Store::open_in_memory().unwrap();
    let session = Uuid::new_v4();
    let (_, mut employees) = seed_session(&store, &["A"]);
    employees[0].id = Uuid::new_v4();
    employees[0].session_id = session;
    employees[0].phone = None;
    store.create_session(session, "x.csv", "Sheet1", &employees).unwrap();

    let delivery = Arc::new(FakeDelivery::new());
    let coord = coordinator(&store, Arc::new(FakeRenderer::new()), Some(delivery.clone()), 1);
    coord.start_batch(session, Operation::GenerateAndSend).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();

    let task = &coord.tasks(session).await.unwrap()[0];
    assert_eq!(task.state, TaskState::DeliveryFailed);
    assert!(task.error.as_ref().unwrap().message.contains("no contact"));
    assert_eq!(delivery.calls(), 0);
}

#[tokio::test]
async fn stored_state_is_served_without_a_run() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A", "B"]);
    let coord = coordinator(&store, Arc::new(FakeRenderer::new()), None, 2);
    coord.start_batch(session, Operation::Generate).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();

    // A fresh coordinator over the same store has no run in memory, as after a restart.
    let restarted = coordinator(&store, Arc::new(FakeRenderer::new()), None, 2);
    let progress = restarted.progress(session).await.unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.operation, Some(Operation::Generate));
    assert_eq!(progress.counts.rendered, 2);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.pending, 0);
    let tasks = restarted.tasks(session).await.unwrap();
    assert!(tasks.iter().all(|t| t.slip_hash.is_some()));
    assert!(restarted.history(session).await.unwrap().is_empty());

    let mut sub = restarted.subscribe(session).await.unwrap();
    assert_eq!(sub.recv().await.map(|m| m.kind()), Some("snapshot"));
    assert_eq!(sub.recv().await.map(|m| m.kind()), Some("closed"));
}

#[tokio::test]
async fn older_finished_runs_are_dropped_from_memory() {
    let store = Store::open_in_memory().unwrap();
    let (first, _) = seed_session(&store, &["A", "B"]);
    let (second, _) = seed_session(&store, &["C"]);
    let settings = BatchSettings {
        retained_runs: 0,
        ..settings()
    };
    let coord = coordinator_with(&store, Arc::new(FakeRenderer::new()), None, 2, settings);

    coord.start_batch(first, Operation::Generate).await.unwrap();
    coord.wait_for_completion(first).await.unwrap();

    coord.start_batch(second, Operation::Generate).await.unwrap();
    assert!(coord.history(first).await.unwrap().is_empty());
    let progress = coord.progress(first).await.unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.pending, 0);
    coord.wait_for_completion(second).await.unwrap();
}

#[tokio::test]
async fn retry_after_restart_uses_the_stored_run() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A", "B", "C"]);
    let renderer = Arc::new(FakeRenderer::new());
    renderer.fail("B", vec![RenderError::Encoding("truncated PNG".into())]);
    let coord = coordinator(&store, renderer.clone(), None, 2);
    coord.start_batch(session, Operation::Generate).await.unwrap();
    coord.wait_for_completion(session).await.unwrap();

    let restarted = coordinator(&store, renderer.clone(), None, 2);
    let snapshot = restarted.retry_failed(session).await.unwrap();
    assert_eq!(snapshot.operation, Some(Operation::Generate));
    assert_eq!(snapshot.total, 3);
    assert_eq!(
        restarted.wait_for_completion(session).await.unwrap(),
        SessionStatus::Completed
    );

    let tasks = restarted.tasks(session).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Rendered));
    assert_eq!(renderer.calls_for("A"), 1);
    assert_eq!(renderer.calls_for("B"), 2);
    assert_eq!(renderer.calls_for("C"), 1);
    assert!(matches!(
        restarted.retry_failed(session).await,
        Err(PipelineError::NothingToRetry(_))
    ));
}

#[tokio::test]
async fn deleting_a_session_releases_its_run() {
    let store = Store::open_in_memory().unwrap();
    let (session, _) = seed_session(&store, &["A"]);
    let renderer = Arc::new(FakeRenderer::new());
    renderer.hold("A");
    let coord = coordinator(&store, renderer.clone(), None, 1);

    coord.start_batch(session, Operation::Generate).await.unwrap();
    assert!(matches!(
        coord.delete_session(session).await,
        Err(PipelineError::Conflict(_))
    ));
    renderer.open("A");
    coord.wait_for_completion(session).await.unwrap();

    coord.delete_session(session).await.unwrap();
    assert!(matches!(
        coord.progress(session).await,
        Err(PipelineError::SessionNotFound(_))
    ));
    assert!(matches!(
        coord.delete_session(session).await,
        Err(PipelineError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn single_employee_run_leaves_the_others_alone() {
    let store = Store::open_in_memory().unwrap();
    let (session, employees) = seed_session(&store, &["A", "B"]);
    let renderer = Arc::new(FakeRenderer::new());
    let coord = coordinator(&store, renderer.clone(), None, 2);

    let snapshot = coord
        .start_employee(session, employees[1].id, Operation::Generate)
        .await
        .unwrap();
    assert_eq!(snapshot.total, 1);
    coord.wait_for_completion(session).await.unwrap();
    assert_eq!(renderer.calls_for("A"), 0);
    assert_eq!(renderer.calls_for("B"), 1);
    assert!(store.slip(employees[1].id).unwrap().is_some());
    assert!(store.slip(employees[0].id).unwrap().is_none());

    assert!(matches!(
        coord
            .start_employee(session, Uuid::new_v4(), Operation::Generate)
            .await,
        Err(PipelineError::EmployeeNotFound(_))
    ));
}

