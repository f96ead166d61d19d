//! Chat action executor: workspace/agent edits and chat rename driven by a
//! chat turn's parsed actions.
//!
//! Each action executes independently; a failure is recorded and the rest
//! still run. Non-`rename_chat` actions are honoured only for chats owned by
//! the built-in management agent. After the batch, genuine failures are
//! summarised in one trailing system message (skipped renames are not
//! counted as failures there).

use crate::events::{EventBus, RunnerEvent};
use crate::model::{Chat, MessageRole, Workspace};
use crate::runner::output::ChatAction;
use crate::store::agents::AgentUpdate;
use crate::store::workspaces::WorkspaceUpdate;
use crate::store::{Store, StoreError};

const ACTION_SKIPPED: &str = "Action skipped";
const ACTION_NOT_PERMITTED: &str = "Action not permitted for this agent";

#[derive(Debug, Clone)]
pub struct ChatActionOutcome {
    pub action_type: &'static str,
    pub success: bool,
    pub error: Option<String>,
}

impl ChatActionOutcome {
    fn ok(action_type: &'static str) -> Self {
        Self {
            action_type,
            success: true,
            error: None,
        }
    }

    fn failed(action_type: &'static str, error: String) -> Self {
        Self {
            action_type,
            success: false,
            error: Some(error),
        }
    }
}

/// Execute `actions` in order. `can_rename` is the first-response gate the
/// worker captured before writing anything.
pub fn execute_chat_actions(
    store: &Store,
    bus: &EventBus,
    chat: &Chat,
    workspace: &Workspace,
    actions: &[ChatAction],
    can_rename: bool,
) -> Result<Vec<ChatActionOutcome>, StoreError> {
    let is_management = chat.agent_id.is_none();
    let mut outcomes = Vec::with_capacity(actions.len());

    for action in actions {
        let action_type = action.type_name();
        if !is_management && !matches!(action, ChatAction::RenameChat { .. }) {
            outcomes.push(ChatActionOutcome::failed(
                action_type,
                ACTION_NOT_PERMITTED.to_string(),
            ));
            continue;
        }
        let outcome = match apply_action(store, chat, workspace, action, can_rename) {
            Ok(()) => ChatActionOutcome::ok(action_type),
            Err(e) => ChatActionOutcome::failed(action_type, e.to_string()),
        };
        outcomes.push(outcome);
    }

    if !actions.is_empty() {
        store.touch_workspace_activity(&workspace.id)?;
    }

    // One trailing system message for genuine failures; skipped renames are
    // expected on every reply after the first and stay quiet.
    let failures: Vec<&ChatActionOutcome> = outcomes
        .iter()
        .filter(|o| !o.success && o.error.as_deref() != Some(ACTION_SKIPPED))
        .collect();
    if !failures.is_empty() {
        let mut summary = String::from("Some actions failed:");
        for f in &failures {
            summary.push_str(&format!(
                "\n- {}: {}",
                f.action_type,
                f.error.as_deref().unwrap_or("unknown error")
            ));
        }
        store.create_chat_message(&chat.id, MessageRole::System, &summary, None)?;
        bus.emit(RunnerEvent::ChatMessageAdded {
            workspace_id: workspace.id.clone(),
            chat_id: chat.id.clone(),
            chat_title: chat.title.clone(),
            author_type: MessageRole::System,
        });
    }

    Ok(outcomes)
}

fn apply_action(
    store: &Store,
    chat: &Chat,
    workspace: &Workspace,
    action: &ChatAction,
    can_rename: bool,
) -> Result<(), StoreError> {
    match action {
        ChatAction::CreateAgent {
            name,
            instruction,
            cli_type,
            order,
        } => {
            store.create_agent(&workspace.id, name, instruction, *cli_type, *order)?;
            Ok(())
        }
        ChatAction::UpdateAgent {
            agent_id,
            name,
            instruction,
            cli_type,
            order,
        } => {
            require_workspace_agent(store, workspace, agent_id)?;
            store.update_agent(
                agent_id,
                &AgentUpdate {
                    name: name.clone(),
                    instruction: instruction.clone(),
                    cli_type: *cli_type,
                    ord: *order,
                },
            )?;
            Ok(())
        }
        ChatAction::DeleteAgent { agent_id } => {
            require_workspace_agent(store, workspace, agent_id)?;
            store.delete_agent(agent_id)
        }
        ChatAction::ReorderAgents { agent_ids } => store.reorder_agents(&workspace.id, agent_ids),
        ChatAction::UpdateWorkspace {
            title,
            description,
            working_directory,
            notify_on_error,
            notify_on_in_review,
        } => {
            store.update_workspace(
                &workspace.id,
                &WorkspaceUpdate {
                    title: title.clone(),
                    description: description.clone(),
                    working_dir_path: working_directory.clone(),
                    notify_on_error: *notify_on_error,
                    notify_on_in_review: *notify_on_in_review,
                },
            )?;
            Ok(())
        }
        ChatAction::RenameChat { title } => {
            if !can_rename {
                return Err(StoreError::Invalid(ACTION_SKIPPED.to_string()));
            }
            store.update_chat_title(&chat.id, title)
        }
    }
}

fn require_workspace_agent(
    store: &Store,
    workspace: &Workspace,
    agent_id: &str,
) -> Result<(), StoreError> {
    match store.agent_by_id(agent_id)? {
        Some(agent) if agent.workspace_id == workspace.id => Ok(()),
        _ => Err(StoreError::NotFound(format!("agent {agent_id}"))),
    }
}
