//! Task action executor: applies one agent's parsed actions atomically
//! against the store, writes the activity log, bumps workspace activity,
//! and emits the matching events.

use serde_json::json;

use crate::events::{EventBus, RunnerEvent};
use crate::model::{ActorType, Agent, Task, TaskStatus, Workspace};
use crate::runner::output::TaskAction;
use crate::store::{Store, StoreError};

/// What one batch of actions did to the task.
#[derive(Debug, Clone, Default)]
pub struct TaskActionResult {
    pub comments_added: usize,
    pub status_changed: bool,
    pub new_status: Option<TaskStatus>,
    /// True iff every action was `skip` and at least one action was
    /// processed.
    pub skipped: bool,
}

/// Apply `actions` in array order. The caller passes the task as currently
/// loaded; status no-ops are detected against the status as it evolves
/// through the batch.
pub fn execute_task_actions(
    store: &Store,
    bus: &EventBus,
    task: &Task,
    workspace: &Workspace,
    agent: &Agent,
    actions: &[TaskAction],
) -> Result<TaskActionResult, StoreError> {
    let mut result = TaskActionResult::default();
    let mut current_status = task.status;
    let mut skips = 0usize;

    for action in actions {
        match action {
            TaskAction::Skip => {
                skips += 1;
            }
            TaskAction::Comment { content } => {
                store.create_task_comment(
                    &task.id,
                    &workspace.id,
                    None,
                    Some(&agent.id),
                    content,
                )?;
                store.create_task_log(
                    &task.id,
                    &workspace.id,
                    "comment_added",
                    ActorType::Agent,
                    Some(&agent.id),
                    Some(&json!({ "agentName": agent.name })),
                )?;
                bus.emit(RunnerEvent::TaskCommentAdded {
                    workspace_id: workspace.id.clone(),
                    task_id: task.id.clone(),
                    task_summary: task.summary.clone(),
                    author_name: agent.name.clone(),
                });
                result.comments_added += 1;
            }
            TaskAction::ChangeStatus { status } => {
                if *status == current_status {
                    continue;
                }
                store.update_task_status(&task.id, *status)?;
                store.create_task_log(
                    &task.id,
                    &workspace.id,
                    "status_changed",
                    ActorType::Agent,
                    Some(&agent.id),
                    Some(&json!({
                        "oldStatus": current_status.as_str(),
                        "newStatus": status.as_str(),
                        "agentName": agent.name,
                    })),
                )?;
                bus.emit(RunnerEvent::TaskStatusChanged {
                    workspace_id: workspace.id.clone(),
                    task_id: task.id.clone(),
                    task_summary: task.summary.clone(),
                    old_status: current_status,
                    new_status: *status,
                });
                current_status = *status;
                result.status_changed = true;
                result.new_status = Some(*status);
            }
        }
    }

    result.skipped = !actions.is_empty() && skips == actions.len();
    if !actions.is_empty() {
        store.touch_workspace_activity(&workspace.id)?;
    }
    Ok(result)
}

/// Persist a comment attributed to neither user nor agent, with its log row,
/// and bump workspace activity.
pub fn add_system_comment(
    store: &Store,
    bus: &EventBus,
    task: &Task,
    workspace: &Workspace,
    content: &str,
) -> Result<(), StoreError> {
    store.create_task_comment(&task.id, &workspace.id, None, None, content)?;
    store.create_task_log(
        &task.id,
        &workspace.id,
        "comment_added",
        ActorType::System,
        None,
        None,
    )?;
    bus.emit(RunnerEvent::TaskCommentAdded {
        workspace_id: workspace.id.clone(),
        task_id: task.id.clone(),
        task_summary: task.summary.clone(),
        author_name: "System".to_string(),
    });
    store.touch_workspace_activity(&workspace.id)
}

/// Runner-driven status change (pickup, empty workspace, all-skipped).
/// No-op when the status already matches.
pub fn update_task_status_with_log(
    store: &Store,
    bus: &EventBus,
    task: &Task,
    workspace: &Workspace,
    new_status: TaskStatus,
) -> Result<(), StoreError> {
    if task.status == new_status {
        return Ok(());
    }
    store.update_task_status(&task.id, new_status)?;
    store.create_task_log(
        &task.id,
        &workspace.id,
        "status_changed",
        ActorType::System,
        None,
        Some(&json!({
            "oldStatus": task.status.as_str(),
            "newStatus": new_status.as_str(),
        })),
    )?;
    bus.emit(RunnerEvent::TaskStatusChanged {
        workspace_id: workspace.id.clone(),
        task_id: task.id.clone(),
        task_summary: task.summary.clone(),
        old_status: task.status,
        new_status,
    });
    Ok(())
}
