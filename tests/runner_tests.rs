//! End-to-end scenarios for the task and chat workers against the scripted
//! stub CLI.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{event_types, harness, Script};
use malamar::events::RunnerEvent;
use malamar::model::{ActorType, MessageRole, QueueStatus, TaskStatus};
use malamar::runner::chat_worker::process_chat;
use malamar::runner::task_worker::process_task;
use malamar::runner::{Runner, RunnerContext};

fn skip() -> serde_json::Value {
    json!({"actions": [{"type": "skip"}]})
}

// ── S1: empty-workspace task ─────────────────────────────────────────────────

#[tokio::test]
async fn empty_workspace_task_goes_straight_to_review() {
    let h = harness(vec![]);
    let ws = h.workspace("W");
    let task = h.task(&ws, "Fix bug");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();

    process_task(&h.ctx, &item).await.unwrap();

    assert_eq!(
        h.store().task_by_id(&task.id).unwrap().unwrap().status,
        TaskStatus::InReview
    );
    assert_eq!(
        h.store()
            .task_queue_item_by_id(&item.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Completed
    );

    let logs = h.store().logs_by_task(&task.id).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].event_type, "status_changed");
    assert_eq!(logs[0].actor_type, ActorType::System);

    assert_eq!(h.stub.invocation_count(), 0);
}

// ── S2: comment restarts the pipeline, then a status ends it ─────────────────

#[tokio::test]
async fn single_agent_comment_then_status() {
    let h = harness(vec![
        Script::Output(json!({"actions": [{"type": "comment", "content": "plan"}]})),
        Script::Output(json!({"actions": [{"type": "change_status", "status": "done"}]})),
    ]);
    let ws = h.workspace("W");
    h.agent(&ws, "A1");
    let task = h.task(&ws, "Fix bug");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();

    process_task(&h.ctx, &item).await.unwrap();

    assert_eq!(
        h.store().task_by_id(&task.id).unwrap().unwrap().status,
        TaskStatus::Done
    );
    assert_eq!(h.stub.invocation_count(), 2);

    let comments = h.store().comments_by_task(&task.id).unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].content, "plan");

    let logs = h.store().logs_by_task(&task.id).unwrap();
    let started: Vec<_> = logs
        .iter()
        .filter(|l| l.event_type == "agent_started")
        .collect();
    assert_eq!(started.len(), 2, "the comment restarts the pass");

    let status_changes: Vec<_> = logs
        .iter()
        .filter(|l| l.event_type == "status_changed")
        .collect();
    // todo → in_progress (system pickup), in_progress → done (agent).
    assert_eq!(status_changes.len(), 2);
    assert_eq!(status_changes[1].actor_type, ActorType::Agent);
}

// ── S3: all-skip pipeline parks in review ────────────────────────────────────

#[tokio::test]
async fn all_skip_pipeline_ends_in_review() {
    let h = harness(vec![Script::Output(skip()), Script::Output(skip())]);
    let ws = h.workspace("W");
    h.agent(&ws, "A1");
    h.agent(&ws, "A2");
    let task = h.task(&ws, "Fix bug");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();
    let events = h.record_events();

    process_task(&h.ctx, &item).await.unwrap();

    assert_eq!(
        h.store().task_by_id(&task.id).unwrap().unwrap().status,
        TaskStatus::InReview
    );
    assert!(h.store().comments_by_task(&task.id).unwrap().is_empty());

    // Agent starts in configured order.
    let started: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            RunnerEvent::AgentExecutionStarted { agent_name, .. } => Some(agent_name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(started, ["A1", "A2"]);

    // Forced review is a system status change.
    let logs = h.store().logs_by_task(&task.id).unwrap();
    let last = logs
        .iter()
        .filter(|l| l.event_type == "status_changed")
        .next_back()
        .unwrap();
    assert_eq!(last.actor_type, ActorType::System);
    let meta: serde_json::Value = serde_json::from_str(last.metadata.as_deref().unwrap()).unwrap();
    assert_eq!(meta["newStatus"], "in_review");
}

// ── S4: CLI failure mid-iteration ────────────────────────────────────────────

#[tokio::test]
async fn cli_failure_mid_iteration_fails_the_row() {
    let h = harness(vec![
        Script::Output(json!({"actions": [{"type": "comment", "content": "ok"}]})),
        Script::Fail {
            exit_code: 2,
            stderr: "boom".into(),
        },
    ]);
    let ws = h.workspace("W");
    h.agent(&ws, "A1");
    h.agent(&ws, "A2");
    let task = h.task(&ws, "Fix bug");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();
    let events = h.record_events();

    let err = process_task(&h.ctx, &item).await.unwrap_err();
    assert!(err.to_string().contains("code 2"));

    let comments = h.store().comments_by_task(&task.id).unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].content, "ok");
    assert_eq!(comments[1].content, "[A2] Error: CLI exited with code 2. boom");
    assert!(comments[1].user_id.is_none() && comments[1].agent_id.is_none());

    let error_events: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            RunnerEvent::TaskErrorOccurred { error_message, .. } => Some(error_message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(error_events.len(), 1);
    assert!(error_events[0].contains("code 2"));

    assert_eq!(
        h.store()
            .task_queue_item_by_id(&item.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Failed
    );
}

// ── Output-shape failures surface like CLI failures ──────────────────────────

#[tokio::test]
async fn missing_output_file_fails_with_stable_prefix() {
    let h = harness(vec![Script::NoOutput]);
    let ws = h.workspace("W");
    h.agent(&ws, "A1");
    let task = h.task(&ws, "Fix bug");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();

    process_task(&h.ctx, &item).await.unwrap_err();

    let comments = h.store().comments_by_task(&task.id).unwrap();
    assert!(comments[0]
        .content
        .contains("CLI completed but output file was not created at "));
}

#[tokio::test]
async fn malformed_output_fails_with_json_prefix() {
    let h = harness(vec![Script::Raw("{not json".into())]);
    let ws = h.workspace("W");
    h.agent(&ws, "A1");
    let task = h.task(&ws, "Fix bug");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();

    process_task(&h.ctx, &item).await.unwrap_err();

    let comments = h.store().comments_by_task(&task.id).unwrap();
    assert!(comments[0].content.contains("CLI output was not valid JSON:"));
}

// ── Missing entities fail the row benignly ───────────────────────────────────

#[tokio::test]
async fn task_deleted_under_the_worker_is_tolerated() {
    // Deleting the task cascades its queue row: the worker loses the claim
    // and returns quietly without invoking anything.
    let h = harness(vec![]);
    let ws = h.workspace("W");
    let task = h.task(&ws, "Fix bug");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();

    h.store().delete_task(&task.id).unwrap();
    process_task(&h.ctx, &item).await.unwrap();
    assert_eq!(h.stub.invocation_count(), 0);
    assert!(h.store().task_queue_item_by_id(&item.id).unwrap().is_none());
}

// ── S5: first-response rename only ───────────────────────────────────────────

#[tokio::test]
async fn chat_rename_applies_only_on_first_response() {
    let h = harness(vec![Script::Output(json!({
        "message": "hi",
        "actions": [{"type": "rename_chat", "title": "Onboarding"}],
    }))]);
    let ws = h.workspace("W");
    let chat = h.store().create_chat(&ws.id, None, None, "New Chat").unwrap();

    h.store()
        .create_chat_message(&chat.id, MessageRole::User, "hello", None)
        .unwrap();
    let item = h.store().enqueue_chat(&chat.id, &ws.id).unwrap();
    process_chat(&h.ctx, &item).await.unwrap();

    assert_eq!(
        h.store().chat_by_id(&chat.id).unwrap().unwrap().title,
        "Onboarding"
    );
    let messages = h.store().messages_by_chat(&chat.id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Agent);
    assert_eq!(messages[1].message, "hi");
    assert!(messages[1].actions.as_deref().unwrap().contains("rename_chat"));

    // Second turn: the rename window is closed.
    h.stub.push_script(Script::Output(json!({
        "message": "hello again",
        "actions": [{"type": "rename_chat", "title": "Ignored"}],
    })));
    h.store()
        .create_chat_message(&chat.id, MessageRole::User, "and again", None)
        .unwrap();
    let item2 = h.store().enqueue_chat(&chat.id, &ws.id).unwrap();
    process_chat(&h.ctx, &item2).await.unwrap();

    assert_eq!(
        h.store().chat_by_id(&chat.id).unwrap().unwrap().title,
        "Onboarding"
    );
    let messages = h.store().messages_by_chat(&chat.id).unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[3].message, "hello again");
    // Skipped rename: no failure-summary system message.
    assert!(messages.iter().all(|m| m.role != MessageRole::System));
    assert_eq!(
        h.store()
            .chat_queue_item_by_id(&item2.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Completed
    );
}

// ── Chat worker effects ──────────────────────────────────────────────────────

#[tokio::test]
async fn management_chat_actions_take_effect() {
    let h = harness(vec![Script::Output(json!({
        "message": "Created your pipeline.",
        "actions": [
            {"type": "create_agent", "name": "Planner", "instruction": "Plan.", "cliType": "claude"},
            {"type": "create_agent", "name": "Coder", "instruction": "Code.", "cliType": "codex"},
        ],
    }))]);
    let ws = h.workspace("W");
    let chat = h.store().create_chat(&ws.id, None, None, "New Chat").unwrap();
    h.store()
        .create_chat_message(&chat.id, MessageRole::User, "set up a pipeline", None)
        .unwrap();
    let item = h.store().enqueue_chat(&chat.id, &ws.id).unwrap();
    let events = h.record_events();

    process_chat(&h.ctx, &item).await.unwrap();

    let agents = h.store().agents_by_workspace(&ws.id).unwrap();
    let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["Planner", "Coder"]);

    assert_eq!(
        event_types(&events),
        [
            "chat.processing_started",
            "chat.message_added",
            "chat.processing_finished"
        ]
    );
}

#[tokio::test]
async fn chat_action_failure_is_summarised_and_row_completes() {
    let h = harness(vec![Script::Output(json!({
        "message": "removing",
        "actions": [{"type": "delete_agent", "agentId": "ghost"}],
    }))]);
    let ws = h.workspace("W");
    let chat = h.store().create_chat(&ws.id, None, None, "C").unwrap();
    let item = h.store().enqueue_chat(&chat.id, &ws.id).unwrap();

    process_chat(&h.ctx, &item).await.unwrap();

    let messages = h.store().messages_by_chat(&chat.id).unwrap();
    // Agent message first, then the failure summary.
    assert_eq!(messages[0].role, MessageRole::Agent);
    assert_eq!(messages[1].role, MessageRole::System);
    assert!(messages[1].message.starts_with("Some actions failed:"));

    // Actions were delivered; some failed. The row still completes.
    assert_eq!(
        h.store()
            .chat_queue_item_by_id(&item.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Completed
    );
}

#[tokio::test]
async fn chat_cli_failure_writes_system_message_and_fails() {
    let h = harness(vec![Script::Fail {
        exit_code: 3,
        stderr: "no api key".into(),
    }]);
    let ws = h.workspace("W");
    let chat = h.store().create_chat(&ws.id, None, None, "C").unwrap();
    let item = h.store().enqueue_chat(&chat.id, &ws.id).unwrap();
    let events = h.record_events();

    process_chat(&h.ctx, &item).await.unwrap_err();

    let messages = h.store().messages_by_chat(&chat.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::System);
    assert!(messages[0].message.contains("CLI exited with code 3. no api key"));

    assert!(event_types(&events).contains(&"chat.processing_finished"));
    assert_eq!(
        h.store()
            .chat_queue_item_by_id(&item.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Failed
    );
}

#[tokio::test]
async fn queue_row_deleted_under_the_worker_is_tolerated() {
    // A chat delete cascades its queue rows: the worker loses the claim and
    // returns quietly without invoking anything.
    let h = harness(vec![]);
    let ws = h.workspace("W");
    let chat = h.store().create_chat(&ws.id, None, None, "C").unwrap();
    let item = h.store().enqueue_chat(&chat.id, &ws.id).unwrap();

    h.store().delete_chat(&chat.id).unwrap();

    process_chat(&h.ctx, &item).await.unwrap();
    assert_eq!(h.stub.invocation_count(), 0);
    assert!(h.store().chat_queue_item_by_id(&item.id).unwrap().is_none());
}

// ── S6: graceful shutdown ────────────────────────────────────────────────────

#[tokio::test]
async fn graceful_shutdown_kills_and_fails_in_flight_work() {
    let h = harness(vec![Script::Hang]);
    let ws = h.workspace("W");
    h.agent(&ws, "A1");
    let task = h.task(&ws, "Long run");
    let item = h.store().enqueue_task(&task.id, &ws.id, false).unwrap();

    let runner = Runner::new(
        RunnerContext {
            store: h.ctx.store.clone(),
            bus: h.ctx.bus.clone(),
            processes: h.ctx.processes.clone(),
            cli: h.ctx.cli.clone(),
            temp_dir: h.ctx.temp_dir.clone(),
            mailgun_configured: false,
        },
        Duration::from_millis(50),
    );
    runner.start().await.unwrap();

    // Wait for the worker to be mid-CLI.
    for _ in 0..50 {
        if h.stub.invocation_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.stub.invocation_count(), 1);

    runner.stop().await;
    assert!(!runner.is_running());

    // The kill surfaced as a CLI failure and the row was finalized.
    assert_eq!(
        h.store()
            .task_queue_item_by_id(&item.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Failed
    );

    // Pollers are stopped: new work is not picked up.
    let task2 = h.task(&ws, "After stop");
    let item2 = h.store().enqueue_task(&task2.id, &ws.id, false).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.store()
            .task_queue_item_by_id(&item2.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Queued
    );
}

// ── Cancellation route ───────────────────────────────────────────────────────

#[tokio::test]
async fn kill_chat_mid_run_surfaces_as_failure() {
    let h = harness(vec![Script::Hang]);
    let ws = h.workspace("W");
    let chat = h.store().create_chat(&ws.id, None, None, "C").unwrap();
    let item = h.store().enqueue_chat(&chat.id, &ws.id).unwrap();

    let ctx = h.ctx.clone();
    let worker_item = item.clone();
    let worker = tokio::spawn(async move { process_chat(&ctx, &worker_item).await });

    for _ in 0..50 {
        if h.stub.invocation_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.ctx.processes.kill_chat(&chat.id));

    let result = worker.await.unwrap();
    assert!(result.is_err());
    assert_eq!(
        h.store()
            .chat_queue_item_by_id(&item.id)
            .unwrap()
            .unwrap()
            .status,
        QueueStatus::Failed
    );
    let messages = h.store().messages_by_chat(&chat.id).unwrap();
    assert!(messages[0].message.contains("terminated"));
}
