//! Chat worker: one chat turn. Resolves the CLI, invokes it over the
//! transcript, persist the reply, run the chat actions.

use serde_json::Value;

use crate::events::RunnerEvent;
use crate::model::{Chat, ChatQueueItem, CliKind, MessageRole, QueueStatus, Workspace};
use crate::runner::chat_actions::execute_chat_actions;
use crate::runner::cli::{InvokeKind, InvokeRequest};
use crate::runner::input::{
    build_chat_context, build_chat_input, chat_context_path, chat_input_path, ChatInputCtx,
    WorkspaceContext,
};
use crate::runner::output::{generate_error_comment, parse_chat_output_file, ChatOutput};
use crate::runner::{resolve_working_dir, RunnerContext, WorkerError};

/// Process one chat queue row to completion. Claims the row first; losing
/// the claim is a quiet no-op. The row is always finalized.
pub async fn process_chat(ctx: &RunnerContext, item: &ChatQueueItem) -> Result<(), WorkerError> {
    if !ctx.store.claim_chat_queue_item(&item.id)? {
        return Ok(());
    }
    match run_chat(ctx, item).await {
        Ok(()) => {
            ctx.store
                .update_chat_queue_status(&item.id, QueueStatus::Completed)?;
            Ok(())
        }
        Err(e) => {
            if let Err(mark) = ctx
                .store
                .update_chat_queue_status(&item.id, QueueStatus::Failed)
            {
                tracing::error!(item = %item.id, error = %mark, "failed to mark queue row failed");
            }
            Err(e)
        }
    }
}

async fn run_chat(ctx: &RunnerContext, item: &ChatQueueItem) -> Result<(), WorkerError> {
    let chat = ctx
        .store
        .chat_by_id(&item.chat_id)?
        .ok_or_else(|| WorkerError::Missing(format!("chat {}", item.chat_id)))?;
    let workspace = ctx
        .store
        .workspace_by_id(&chat.workspace_id)?
        .ok_or_else(|| WorkerError::Missing(format!("workspace {}", chat.workspace_id)))?;

    // A dangling agent id falls back to the built-in management agent.
    let agent = match chat.agent_id {
        Some(ref id) => ctx.store.agent_by_id(id)?,
        None => None,
    };
    let agent_name = agent
        .as_ref()
        .map(|a| a.name.clone())
        .unwrap_or_else(|| "Malamar".to_string());

    let Some(kind) = chat
        .cli_type
        .or_else(|| agent.as_ref().and_then(|a| a.cli_type))
        .or_else(|| ctx.cli.first_healthy())
    else {
        add_system_message(
            ctx,
            &chat,
            &workspace,
            "No CLI is available to process this chat.",
        )?;
        return Err(WorkerError::Cli("no CLI available".into()));
    };

    ctx.bus.emit(RunnerEvent::ChatProcessingStarted {
        workspace_id: workspace.id.clone(),
        chat_id: chat.id.clone(),
        chat_title: chat.title.clone(),
        agent_name: agent_name.clone(),
    });

    let messages = ctx.store.messages_by_chat(&chat.id)?;
    let built = build_chat_input(
        &ChatInputCtx {
            workspace: &workspace,
            agent: agent.as_ref(),
            chat: &chat,
            messages: &messages,
        },
        &ctx.temp_dir,
    );

    let agents = ctx.store.agents_by_workspace(&workspace.id)?;
    let health: Vec<_> = CliKind::ALL
        .iter()
        .map(|k| (*k, ctx.cli.health_of(*k).map(|r| r.state)))
        .collect();
    let context_doc = build_chat_context(&WorkspaceContext {
        workspace: &workspace,
        agents: &agents,
        cli_health: &health,
        mailgun_configured: ctx.mailgun_configured,
    });

    tokio::fs::create_dir_all(&ctx.temp_dir).await?;
    let input_path = chat_input_path(&ctx.temp_dir, &chat.id);
    let context_path = chat_context_path(&ctx.temp_dir, &chat.id);
    tokio::fs::write(&input_path, &built.content).await?;
    tokio::fs::write(&context_path, &context_doc).await?;

    let req = InvokeRequest {
        cli: kind,
        input_path: input_path.clone(),
        output_path: built.output_path.clone(),
        working_dir: resolve_working_dir(&workspace, &ctx.temp_dir),
        kind: InvokeKind::Chat,
    };
    let kill = ctx.processes.track_chat(&chat.id, &workspace.id);
    let outcome = ctx.cli.invoke(&req, kill).await;
    ctx.processes.untrack_chat(&chat.id);

    let parsed: Result<ChatOutput, String> = match outcome {
        Err(e) => Err(e.to_string()),
        Ok(outcome) if !outcome.success => {
            Err(generate_error_comment(outcome.exit_code, &outcome.stderr))
        }
        Ok(_) => parse_chat_output_file(&built.output_path).map_err(|e| e.to_string()),
    };

    // Best-effort cleanup; never gates the worker result.
    let _ = tokio::fs::remove_file(&input_path).await;
    let _ = tokio::fs::remove_file(&context_path).await;
    let _ = tokio::fs::remove_file(&built.output_path).await;

    let output = match parsed {
        Ok(output) => output,
        Err(message) => {
            add_system_message(
                ctx,
                &chat,
                &workspace,
                &format!("[{agent_name}] Error: {message}"),
            )?;
            ctx.bus.emit(RunnerEvent::ChatProcessingFinished {
                workspace_id: workspace.id.clone(),
                chat_id: chat.id.clone(),
                chat_title: chat.title.clone(),
                agent_name,
            });
            return Err(WorkerError::Cli(message));
        }
    };

    // First-response rename window, captured before anything is written.
    let can_rename = ctx.store.count_agent_messages(&chat.id)? == 0;

    if let Some(message) = output.message.as_ref().filter(|m| !m.trim().is_empty()) {
        let actions_json = if output.actions.is_empty() {
            None
        } else {
            Some(
                Value::Array(output.actions.iter().map(|a| a.to_wire_json()).collect())
                    .to_string(),
            )
        };
        ctx.store.create_chat_message(
            &chat.id,
            MessageRole::Agent,
            message,
            actions_json.as_deref(),
        )?;
        ctx.bus.emit(RunnerEvent::ChatMessageAdded {
            workspace_id: workspace.id.clone(),
            chat_id: chat.id.clone(),
            chat_title: chat.title.clone(),
            author_type: MessageRole::Agent,
        });
    }

    if !output.actions.is_empty() {
        // Per-action failures are summarised inside; they do not fail the turn.
        execute_chat_actions(
            &ctx.store,
            &ctx.bus,
            &chat,
            &workspace,
            &output.actions,
            can_rename,
        )?;
    }

    ctx.bus.emit(RunnerEvent::ChatProcessingFinished {
        workspace_id: workspace.id.clone(),
        chat_id: chat.id.clone(),
        chat_title: chat.title.clone(),
        agent_name,
    });
    Ok(())
}

fn add_system_message(
    ctx: &RunnerContext,
    chat: &Chat,
    workspace: &Workspace,
    content: &str,
) -> Result<(), WorkerError> {
    ctx.store
        .create_chat_message(&chat.id, MessageRole::System, content, None)?;
    ctx.bus.emit(RunnerEvent::ChatMessageAdded {
        workspace_id: workspace.id.clone(),
        chat_id: chat.id.clone(),
        chat_title: chat.title.clone(),
        author_type: MessageRole::System,
    });
    Ok(())
}
