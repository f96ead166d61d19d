//! Input builders: the markdown fed to CLI children and the workspace
//! context doc agents read on demand.
//!
//! All builders are pure string assembly plus a fresh output path; the
//! workers write the files. File naming under the temp dir:
//! - task input:    `malamar_task_<taskId>.md`
//! - chat input:    `malamar_chat_<chatId>.md`
//! - chat context:  `malamar_chat_<chatId>_context.md`
//! - task output:   `malamar_output_<id>.json`
//! - chat output:   `malamar_chat_output_<id>.json`
//! where `<id>` is a fresh 21-char URL-safe random id per invocation.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde_json::json;

use crate::model::{
    Agent, Chat, ChatMessage, CliKind, Task, TaskComment, TaskLog, WorkingDirMode, Workspace,
};
use crate::runner::cli::HealthState;

const OUTPUT_ID_LEN: usize = 21;
const OUTPUT_ID_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Instruction block for the built-in management agent (chats with no
/// configured agent).
const MANAGEMENT_INSTRUCTION: &str = "You are Malamar, the built-in management agent for this \
workspace. You help the user set up and tune their workflow: create, update, delete and reorder \
agents, update workspace settings, and rename this chat. Prefer acting through actions over \
describing steps for the user to perform.";

/// Built input: file content plus the output path the child must write to.
#[derive(Debug, Clone)]
pub struct BuiltInput {
    pub content: String,
    pub output_path: PathBuf,
}

pub fn task_input_path(temp_dir: &Path, task_id: &str) -> PathBuf {
    temp_dir.join(format!("malamar_task_{task_id}.md"))
}

pub fn chat_input_path(temp_dir: &Path, chat_id: &str) -> PathBuf {
    temp_dir.join(format!("malamar_chat_{chat_id}.md"))
}

pub fn chat_context_path(temp_dir: &Path, chat_id: &str) -> PathBuf {
    temp_dir.join(format!("malamar_chat_{chat_id}_context.md"))
}

fn output_id() -> String {
    let mut rng = rand::thread_rng();
    (0..OUTPUT_ID_LEN)
        .map(|_| OUTPUT_ID_ALPHABET[rng.gen_range(0..OUTPUT_ID_ALPHABET.len())] as char)
        .collect()
}

// ---------------------------------------------------------------------------
// Task input
// ---------------------------------------------------------------------------

/// Everything the task input references, preloaded by the worker.
#[derive(Debug)]
pub struct TaskInputCtx<'a> {
    pub workspace: &'a Workspace,
    pub agent: &'a Agent,
    pub task: &'a Task,
    pub comments: &'a [TaskComment],
    pub logs: &'a [TaskLog],
    /// All workspace agents, for resolving comment authors by id.
    pub agents: &'a [Agent],
}

pub fn build_task_input(
    ctx: &TaskInputCtx<'_>,
    other_agent_names: &[String],
    temp_dir: &Path,
) -> BuiltInput {
    let output_path = temp_dir.join(format!("malamar_output_{}.json", output_id()));
    let mut out = String::new();

    out.push_str("# Malamar Context\n\n");
    out.push_str(&format!(
        "You are \"{}\", an agent in the \"{}\" workspace of Malamar, a local \
         orchestration service. Work on the task below, then write your response as JSON \
         to the output path given at the end. Do not print the JSON anywhere else.\n",
        ctx.agent.name, ctx.workspace.title
    ));
    if !ctx.workspace.description.trim().is_empty() {
        out.push('\n');
        out.push_str(ctx.workspace.description.trim());
        out.push('\n');
    }

    out.push_str("\n# Your Role\n\n");
    out.push_str(ctx.agent.instruction.trim());
    out.push('\n');

    if !other_agent_names.is_empty() {
        out.push_str("\n# Other Agents in This Workflow\n\n");
        for name in other_agent_names {
            out.push_str(&format!("- {name}\n"));
        }
    }

    out.push_str("\n# Task\n\n## Summary\n\n");
    out.push_str(&ctx.task.summary);
    out.push('\n');
    if !ctx.task.description.trim().is_empty() {
        out.push_str("\n## Description\n\n");
        out.push_str(ctx.task.description.trim());
        out.push('\n');
    }

    out.push_str("\n## Comments\n\n");
    if ctx.comments.is_empty() {
        out.push_str("_No comments yet._\n");
    } else {
        out.push_str("```jsonl\n");
        for comment in ctx.comments {
            out.push_str(&comment_line(comment, ctx.agents));
            out.push('\n');
        }
        out.push_str("```\n");
    }

    out.push_str("\n## Activity Log\n\n");
    if ctx.logs.is_empty() {
        out.push_str("_No activity yet._\n");
    } else {
        out.push_str("```jsonl\n");
        for log in ctx.logs {
            out.push_str(&log_line(log));
            out.push('\n');
        }
        out.push_str("```\n");
    }

    out.push_str("\n# Output Instruction\n\n");
    out.push_str(&format!(
        "Write your response as JSON to: {}\n\n\
         The JSON must be an object {{\"actions\": [...]}} where each action is one of:\n\
         - {{\"type\": \"skip\"}} when there is nothing for you to do right now\n\
         - {{\"type\": \"comment\", \"content\": \"<text>\"}}\n\
         - {{\"type\": \"change_status\", \"status\": \"todo\" | \"in_progress\" | \"in_review\" | \"done\"}}\n",
        output_path.display()
    ));

    BuiltInput {
        content: out,
        output_path,
    }
}

fn comment_author(comment: &TaskComment, agents: &[Agent]) -> String {
    if let Some(ref agent_id) = comment.agent_id {
        return agents
            .iter()
            .find(|a| &a.id == agent_id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| "Agent".to_string());
    }
    if comment.user_id.is_some() {
        return "User".to_string();
    }
    "System".to_string()
}

fn comment_line(comment: &TaskComment, agents: &[Agent]) -> String {
    json!({
        "author": comment_author(comment, agents),
        "content": comment.content,
        "created_at": comment.created_at,
    })
    .to_string()
}

fn log_line(log: &TaskLog) -> String {
    let mut line = json!({
        "event_type": log.event_type,
        "actor_type": log.actor_type.as_str(),
        "created_at": log.created_at,
    });
    if let Some(ref actor_id) = log.actor_id {
        line["actor_id"] = json!(actor_id);
    }
    if let Some(ref metadata) = log.metadata {
        line["metadata"] = serde_json::from_str(metadata)
            .unwrap_or_else(|_| serde_json::Value::String(metadata.clone()));
    }
    line.to_string()
}

// ---------------------------------------------------------------------------
// Chat input
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ChatInputCtx<'a> {
    pub workspace: &'a Workspace,
    /// None selects the built-in management agent.
    pub agent: Option<&'a Agent>,
    pub chat: &'a Chat,
    pub messages: &'a [ChatMessage],
}

pub fn build_chat_input(ctx: &ChatInputCtx<'_>, temp_dir: &Path) -> BuiltInput {
    let output_path = temp_dir.join(format!("malamar_chat_output_{}.json", output_id()));
    let agent_name = ctx.agent.map(|a| a.name.as_str()).unwrap_or("Malamar");
    let mut out = String::new();

    out.push_str("# Malamar Chat Context\n\n");
    match ctx.agent {
        Some(agent) => {
            out.push_str(&format!(
                "You are \"{}\", chatting with the user inside the \"{}\" workspace of \
                 Malamar. Reply by writing JSON to the output path given at the end.\n\n",
                agent.name, ctx.workspace.title
            ));
            out.push_str(agent.instruction.trim());
            out.push('\n');
        }
        None => {
            out.push_str(MANAGEMENT_INSTRUCTION);
            out.push('\n');
        }
    }

    out.push_str("\n# Chat Metadata\n\n");
    out.push_str(&format!("- Chat ID: {}\n", ctx.chat.id));
    out.push_str(&format!("- Workspace: {}\n", ctx.workspace.title));
    out.push_str(&format!("- Agent: {agent_name}\n"));

    out.push_str("\n# Conversation History\n\n");
    if ctx.messages.is_empty() {
        out.push_str("_No messages yet._\n");
    } else {
        out.push_str("```jsonl\n");
        for msg in ctx.messages {
            out.push_str(
                &json!({
                    "role": msg.role.as_str(),
                    "content": msg.message,
                    "created_at": msg.created_at,
                })
                .to_string(),
            );
            out.push('\n');
        }
        out.push_str("```\n");
    }

    out.push_str("\n# Additional Context\n\n");
    out.push_str(&format!(
        "Workspace details (settings, agents, CLI health) live in:\n{}\n\
         Read that file when you need workspace state to answer or act.\n",
        chat_context_path(temp_dir, &ctx.chat.id).display()
    ));

    out.push_str("\n# Output Instruction\n\n");
    out.push_str(&format!(
        "Write your response as JSON to: {}\n\n\
         The JSON is an object with an optional \"message\" string (shown to the user) and \
         an optional \"actions\" array.\n",
        output_path.display()
    ));
    if ctx.agent.is_none() {
        out.push_str(
            "Available actions: create_agent, update_agent, delete_agent, reorder_agents, \
             update_workspace, rename_chat.\n",
        );
    } else {
        out.push_str(
            "Available actions: rename_chat (only honoured for your first reply in a chat).\n",
        );
    }

    BuiltInput {
        content: out,
        output_path,
    }
}

// ---------------------------------------------------------------------------
// Workspace context doc
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct WorkspaceContext<'a> {
    pub workspace: &'a Workspace,
    pub agents: &'a [Agent],
    /// Latest health per CLI kind; None means never probed.
    pub cli_health: &'a [(CliKind, Option<HealthState>)],
    pub mailgun_configured: bool,
}

pub fn build_chat_context(ctx: &WorkspaceContext<'_>) -> String {
    let ws = ctx.workspace;
    let mut out = String::new();

    out.push_str(&format!("# Workspace: {}\n", ws.title));
    if !ws.description.trim().is_empty() {
        out.push('\n');
        out.push_str(ws.description.trim());
        out.push('\n');
    }

    out.push_str("\n## Settings\n\n");
    out.push_str(&format!(
        "- Working directory mode: {}\n",
        ws.working_dir_mode.as_str()
    ));
    if ws.working_dir_mode == WorkingDirMode::Static {
        out.push_str(&format!(
            "- Working directory: {}\n",
            ws.working_dir_path.as_deref().unwrap_or("(unset)")
        ));
    }
    out.push_str(&format!(
        "- Auto-delete done tasks: {} (retention {} days)\n",
        ws.auto_delete_done_tasks, ws.retention_days
    ));
    out.push_str(&format!("- Notify on error: {}\n", ws.notify_on_error));
    out.push_str(&format!(
        "- Notify on in-review: {}\n",
        ws.notify_on_in_review
    ));

    out.push_str("\n## Agents\n\n");
    if ctx.agents.is_empty() {
        out.push_str("_No agents configured._\n");
    } else {
        for agent in ctx.agents {
            let cli = agent
                .cli_type
                .map(|c| c.as_str())
                .unwrap_or("(first healthy)");
            out.push_str(&format!(
                "{}. {} (id: {}, cli: {})\n   {}\n",
                agent.ord,
                agent.name,
                agent.id,
                cli,
                agent.instruction.trim().replace('\n', "\n   ")
            ));
        }
    }

    out.push_str("\n## CLI Health\n\n");
    for (kind, state) in ctx.cli_health {
        let mark = match state {
            Some(HealthState::Healthy) => "✓",
            Some(HealthState::Unhealthy) | Some(HealthState::NotFound) => "✗",
            None => "?",
        };
        out.push_str(&format!("- {}: {mark}\n", kind.as_str()));
    }

    out.push_str("\n## Notifications\n\n");
    if ctx.mailgun_configured {
        out.push_str("Mailgun is configured; email notifications are active.\n");
    } else {
        out.push_str("Mailgun is not configured; email notifications are disabled.\n");
    }

    out
}
