//! Task worker: drives one queued task through the workspace's agents in
//! order, restarting the pass when new comments give later agents fresh
//! context, and forcing review when a full pass produces only skips.

use std::path::Path;

use serde_json::json;

use crate::events::RunnerEvent;
use crate::model::{ActorType, Agent, CliKind, QueueStatus, Task, TaskQueueItem, TaskStatus, Workspace};
use crate::runner::cli::{InvokeKind, InvokeRequest};
use crate::runner::input::{build_task_input, task_input_path, TaskInputCtx};
use crate::runner::output::{generate_error_comment, parse_task_output_file};
use crate::runner::task_actions::{
    add_system_comment, execute_task_actions, update_task_status_with_log, TaskActionResult,
};
use crate::runner::{resolve_working_dir, RunnerContext, WorkerError};

/// Safety cap on full passes through the agent list. A run that hits it has
/// a defective agent CLI stuck in a comment/restart cycle; the run still
/// finalizes normally.
const MAX_TASK_ITERATIONS: u32 = 100;

/// Process one task queue row to completion. Claims the row first; losing
/// the claim to a concurrent spawner is a quiet no-op. The row is always
/// finalized: `completed` on success, `failed` on the first surfaced error.
pub async fn process_task(ctx: &RunnerContext, item: &TaskQueueItem) -> Result<(), WorkerError> {
    if !ctx.store.claim_task_queue_item(&item.id)? {
        return Ok(());
    }
    match run_task(ctx, item).await {
        Ok(()) => {
            ctx.store
                .update_task_queue_status(&item.id, QueueStatus::Completed)?;
            Ok(())
        }
        Err(e) => {
            if let Err(mark) = ctx
                .store
                .update_task_queue_status(&item.id, QueueStatus::Failed)
            {
                tracing::error!(item = %item.id, error = %mark, "failed to mark queue row failed");
            }
            Err(e)
        }
    }
}

async fn run_task(ctx: &RunnerContext, item: &TaskQueueItem) -> Result<(), WorkerError> {
    let mut task = ctx
        .store
        .task_by_id(&item.task_id)?
        .ok_or_else(|| WorkerError::Missing(format!("task {}", item.task_id)))?;
    let workspace = ctx
        .store
        .workspace_by_id(&task.workspace_id)?
        .ok_or_else(|| WorkerError::Missing(format!("workspace {}", task.workspace_id)))?;

    let agents = ctx.store.agents_by_workspace(&workspace.id)?;
    if agents.is_empty() {
        // Nothing can work on it; hand it straight to review.
        update_task_status_with_log(&ctx.store, &ctx.bus, &task, &workspace, TaskStatus::InReview)?;
        return Ok(());
    }

    if task.status == TaskStatus::Todo {
        update_task_status_with_log(
            &ctx.store,
            &ctx.bus,
            &task,
            &workspace,
            TaskStatus::InProgress,
        )?;
        task.status = TaskStatus::InProgress;
    }

    tokio::fs::create_dir_all(&ctx.temp_dir).await?;
    let working_dir = resolve_working_dir(&workspace, &ctx.temp_dir);

    for iteration in 1..=MAX_TASK_ITERATIONS {
        let mut comments_added = 0usize;
        let mut invoked = 0usize;
        let mut all_skipped = true;

        for agent in &agents {
            let Some(kind) = resolve_cli(ctx, agent) else {
                tracing::warn!(agent = %agent.name, "no CLI available, skipping agent");
                continue;
            };

            ctx.store.create_task_log(
                &task.id,
                &workspace.id,
                "agent_started",
                ActorType::Agent,
                Some(&agent.id),
                Some(&json!({ "agentName": agent.name })),
            )?;
            ctx.bus.emit(RunnerEvent::AgentExecutionStarted {
                workspace_id: workspace.id.clone(),
                task_id: task.id.clone(),
                task_summary: task.summary.clone(),
                agent_name: agent.name.clone(),
            });

            let result = invoke_agent(ctx, &task, &workspace, agent, kind, &agents, &working_dir)
                .await;

            ctx.store.create_task_log(
                &task.id,
                &workspace.id,
                "agent_finished",
                ActorType::Agent,
                Some(&agent.id),
                Some(&match result {
                    Ok(_) => json!({ "agentName": agent.name, "success": true }),
                    Err(ref message) => {
                        json!({ "agentName": agent.name, "success": false, "error": message })
                    }
                }),
            )?;
            ctx.bus.emit(RunnerEvent::AgentExecutionFinished {
                workspace_id: workspace.id.clone(),
                task_id: task.id.clone(),
                task_summary: task.summary.clone(),
                agent_name: agent.name.clone(),
            });

            let batch = match result {
                Ok(batch) => batch,
                Err(message) => {
                    // Failure isolation: surface, then stop this task.
                    add_system_comment(
                        &ctx.store,
                        &ctx.bus,
                        &task,
                        &workspace,
                        &format!("[{}] Error: {}", agent.name, message),
                    )?;
                    ctx.bus.emit(RunnerEvent::TaskErrorOccurred {
                        workspace_id: workspace.id.clone(),
                        task_id: task.id.clone(),
                        task_summary: task.summary.clone(),
                        error_message: message.clone(),
                    });
                    return Err(WorkerError::Cli(message));
                }
            };

            invoked += 1;
            comments_added += batch.comments_added;
            if !batch.skipped {
                all_skipped = false;
            }
            if let Some(status) = batch.new_status {
                task.status = status;
                if status != TaskStatus::InProgress {
                    // An agent routed the task elsewhere; the pipeline is done.
                    return Ok(());
                }
            }
        }

        if comments_added > 0 {
            // New comments are new context: restart from the first agent.
            task = ctx
                .store
                .task_by_id(&task.id)?
                .ok_or_else(|| WorkerError::Missing(format!("task {}", task.id)))?;
            if iteration == MAX_TASK_ITERATIONS {
                tracing::warn!(task = %task.id, "iteration cap reached, stopping restarts");
            }
            continue;
        }
        if invoked > 0 && all_skipped {
            update_task_status_with_log(
                &ctx.store,
                &ctx.bus,
                &task,
                &workspace,
                TaskStatus::InReview,
            )?;
            return Ok(());
        }
        break;
    }

    Ok(())
}

/// An agent with no CLI kind takes the first healthy CLI; an explicitly
/// configured kind must currently be available.
fn resolve_cli(ctx: &RunnerContext, agent: &Agent) -> Option<CliKind> {
    match agent.cli_type {
        Some(kind) if ctx.cli.is_available(kind) => Some(kind),
        Some(_) => None,
        None => ctx.cli.first_healthy(),
    }
}

/// One CLI invocation for one agent: build + write input, run the child
/// under registry supervision, parse the output, apply the actions.
/// The Err string is the message for the system comment.
async fn invoke_agent(
    ctx: &RunnerContext,
    task: &Task,
    workspace: &Workspace,
    agent: &Agent,
    kind: CliKind,
    agents: &[Agent],
    working_dir: &Path,
) -> Result<TaskActionResult, String> {
    // Context accumulates across invocations; load it fresh every time.
    let comments = ctx
        .store
        .comments_by_task(&task.id)
        .map_err(|e| e.to_string())?;
    let logs = ctx.store.logs_by_task(&task.id).map_err(|e| e.to_string())?;
    let other_names: Vec<String> = agents
        .iter()
        .filter(|a| a.id != agent.id)
        .map(|a| a.name.clone())
        .collect();

    let built = build_task_input(
        &TaskInputCtx {
            workspace,
            agent,
            task,
            comments: &comments,
            logs: &logs,
            agents,
        },
        &other_names,
        &ctx.temp_dir,
    );
    let input_path = task_input_path(&ctx.temp_dir, &task.id);
    tokio::fs::write(&input_path, &built.content)
        .await
        .map_err(|e| format!("failed to write input file: {e}"))?;

    let req = InvokeRequest {
        cli: kind,
        input_path: input_path.clone(),
        output_path: built.output_path.clone(),
        working_dir: working_dir.to_path_buf(),
        kind: InvokeKind::Task,
    };
    let kill = ctx.processes.track_task(&task.id, &workspace.id);
    let outcome = ctx.cli.invoke(&req, kill).await;
    ctx.processes.untrack_task(&task.id);

    let result = match outcome {
        Err(e) => Err(e.to_string()),
        Ok(outcome) if !outcome.success => {
            Err(generate_error_comment(outcome.exit_code, &outcome.stderr))
        }
        Ok(_) => parse_task_output_file(&built.output_path)
            .map_err(|e| e.to_string())
            .and_then(|parsed| {
                execute_task_actions(&ctx.store, &ctx.bus, task, workspace, agent, &parsed.actions)
                    .map_err(|e| e.to_string())
            }),
    };

    // Best-effort cleanup; never gates the worker result.
    let _ = tokio::fs::remove_file(&input_path).await;
    let _ = tokio::fs::remove_file(&built.output_path).await;

    result
}
