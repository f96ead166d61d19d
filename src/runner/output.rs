//! CLI output parsing: task and chat JSON schemas, strict error ordering.
//!
//! Error kinds are checked strictly in sequence (file missing, file empty,
//! JSON parse, schema) so each failure mode surfaces with a stable message
//! prefix. Validation is hand-written field checks that produce the tagged
//! action enums directly; downstream code never re-inspects type strings.

use std::path::Path;

use serde_json::Value;

use crate::model::{CliKind, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("CLI completed but output file was not created at {0}")]
    FileMissing(String),
    #[error("CLI completed but output file at {0} was empty")]
    FileEmpty(String),
    #[error("CLI output was not valid JSON: {0}")]
    JsonParse(String),
    #[error("CLI output structure was invalid: {0}")]
    SchemaValidation(String),
}

// ---------------------------------------------------------------------------
// Action types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    Skip,
    Comment { content: String },
    ChangeStatus { status: TaskStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub actions: Vec<TaskAction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    CreateAgent {
        name: String,
        instruction: String,
        cli_type: Option<CliKind>,
        order: Option<i64>,
    },
    UpdateAgent {
        agent_id: String,
        name: Option<String>,
        instruction: Option<String>,
        /// Outer `None` = absent; `Some(None)` = explicit null to clear.
        cli_type: Option<Option<CliKind>>,
        order: Option<i64>,
    },
    DeleteAgent {
        agent_id: String,
    },
    ReorderAgents {
        agent_ids: Vec<String>,
    },
    UpdateWorkspace {
        title: Option<String>,
        description: Option<String>,
        working_directory: Option<String>,
        notify_on_error: Option<bool>,
        notify_on_in_review: Option<bool>,
    },
    RenameChat {
        title: String,
    },
}

impl ChatAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CreateAgent { .. } => "create_agent",
            Self::UpdateAgent { .. } => "update_agent",
            Self::DeleteAgent { .. } => "delete_agent",
            Self::ReorderAgents { .. } => "reorder_agents",
            Self::UpdateWorkspace { .. } => "update_workspace",
            Self::RenameChat { .. } => "rename_chat",
        }
    }

    /// Wire-shape JSON, as stored alongside the chat message that carried
    /// the action. Absent fields are omitted; an explicit cleared cliType
    /// round-trips as null.
    pub fn to_wire_json(&self) -> Value {
        use serde_json::json;
        let mut obj = json!({ "type": self.type_name() });
        match self {
            Self::CreateAgent {
                name,
                instruction,
                cli_type,
                order,
            } => {
                obj["name"] = json!(name);
                obj["instruction"] = json!(instruction);
                if let Some(cli) = cli_type {
                    obj["cliType"] = json!(cli.as_str());
                }
                if let Some(order) = order {
                    obj["order"] = json!(order);
                }
            }
            Self::UpdateAgent {
                agent_id,
                name,
                instruction,
                cli_type,
                order,
            } => {
                obj["agentId"] = json!(agent_id);
                if let Some(name) = name {
                    obj["name"] = json!(name);
                }
                if let Some(instruction) = instruction {
                    obj["instruction"] = json!(instruction);
                }
                match cli_type {
                    Some(Some(cli)) => obj["cliType"] = json!(cli.as_str()),
                    Some(None) => obj["cliType"] = Value::Null,
                    None => {}
                }
                if let Some(order) = order {
                    obj["order"] = json!(order);
                }
            }
            Self::DeleteAgent { agent_id } => {
                obj["agentId"] = json!(agent_id);
            }
            Self::ReorderAgents { agent_ids } => {
                obj["agentIds"] = json!(agent_ids);
            }
            Self::UpdateWorkspace {
                title,
                description,
                working_directory,
                notify_on_error,
                notify_on_in_review,
            } => {
                if let Some(title) = title {
                    obj["title"] = json!(title);
                }
                if let Some(description) = description {
                    obj["description"] = json!(description);
                }
                if let Some(dir) = working_directory {
                    obj["workingDirectory"] = json!(dir);
                }
                if let Some(notify) = notify_on_error {
                    obj["notifyOnError"] = json!(notify);
                }
                if let Some(notify) = notify_on_in_review {
                    obj["notifyOnInReview"] = json!(notify);
                }
            }
            Self::RenameChat { title } => {
                obj["title"] = json!(title);
            }
        }
        obj
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatOutput {
    pub message: Option<String>,
    pub actions: Vec<ChatAction>,
}

/// Compose the system comment/message for a failed CLI invocation.
pub fn generate_error_comment(exit_code: Option<i32>, stderr: &str) -> String {
    let mut msg = match exit_code {
        Some(code) => format!("CLI exited with code {code}."),
        None => "CLI was terminated before completing.".to_string(),
    };
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        msg.push(' ');
        msg.push_str(stderr);
    }
    msg
}

// ---------------------------------------------------------------------------
// File entry points (file_missing / file_empty, then the string forms)
// ---------------------------------------------------------------------------

pub fn parse_task_output_file(path: &Path) -> Result<TaskOutput, OutputError> {
    parse_task_output(&read_output(path)?)
}

pub fn parse_chat_output_file(path: &Path) -> Result<ChatOutput, OutputError> {
    parse_chat_output(&read_output(path)?)
}

fn read_output(path: &Path) -> Result<String, OutputError> {
    if !path.exists() {
        return Err(OutputError::FileMissing(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|_| OutputError::FileMissing(path.display().to_string()))?;
    if content.trim().is_empty() {
        return Err(OutputError::FileEmpty(path.display().to_string()));
    }
    Ok(content)
}

// ---------------------------------------------------------------------------
// String entry points (json_parse, then schema_validation)
// ---------------------------------------------------------------------------

pub fn parse_task_output(content: &str) -> Result<TaskOutput, OutputError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| OutputError::JsonParse(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| schema_err("root must be an object"))?;
    let actions = obj
        .get("actions")
        .ok_or_else(|| schema_err("actions is required"))?
        .as_array()
        .ok_or_else(|| schema_err("actions must be an array"))?;

    let mut parsed = Vec::with_capacity(actions.len());
    for (i, action) in actions.iter().enumerate() {
        parsed.push(parse_task_action(action, i)?);
    }
    Ok(TaskOutput { actions: parsed })
}

fn parse_task_action(action: &Value, i: usize) -> Result<TaskAction, OutputError> {
    let obj = action
        .as_object()
        .ok_or_else(|| schema_err(&format!("actions[{i}] must be an object")))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| schema_err(&format!("actions[{i}].type must be a string")))?;

    match kind {
        "skip" => Ok(TaskAction::Skip),
        "comment" => {
            let content = required_string(obj, "content", &format!("actions[{i}].content"))?;
            Ok(TaskAction::Comment { content })
        }
        "change_status" => {
            let status = obj
                .get("status")
                .and_then(Value::as_str)
                .and_then(TaskStatus::parse)
                .ok_or_else(|| {
                    schema_err(&format!(
                        "actions[{i}].status must be one of todo, in_progress, in_review, done"
                    ))
                })?;
            Ok(TaskAction::ChangeStatus { status })
        }
        other => Err(schema_err(&format!(
            "actions[{i}].type: unknown action type '{other}'"
        ))),
    }
}

pub fn parse_chat_output(content: &str) -> Result<ChatOutput, OutputError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| OutputError::JsonParse(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| schema_err("root must be an object"))?;

    let message = match obj.get("message") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(schema_err("message must be a string")),
    };

    let mut actions = Vec::new();
    match obj.get("actions") {
        None | Some(Value::Null) => {}
        Some(Value::Array(list)) => {
            for (i, action) in list.iter().enumerate() {
                actions.push(parse_chat_action(action, i)?);
            }
        }
        Some(_) => return Err(schema_err("actions must be an array")),
    }

    Ok(ChatOutput { message, actions })
}

fn parse_chat_action(action: &Value, i: usize) -> Result<ChatAction, OutputError> {
    let obj = action
        .as_object()
        .ok_or_else(|| schema_err(&format!("actions[{i}] must be an object")))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| schema_err(&format!("actions[{i}].type must be a string")))?;
    let at = |field: &str| format!("actions[{i}].{field}");

    match kind {
        "create_agent" => Ok(ChatAction::CreateAgent {
            name: required_string(obj, "name", &at("name"))?,
            instruction: required_string(obj, "instruction", &at("instruction"))?,
            cli_type: optional_cli_kind(obj, "cliType", &at("cliType"))?,
            order: optional_order(obj, "order", &at("order"))?,
        }),
        "update_agent" => {
            let cli_type = match obj.get("cliType") {
                None => None,
                Some(Value::Null) => Some(None),
                Some(Value::String(s)) => Some(Some(CliKind::parse(s).ok_or_else(|| {
                    schema_err(&format!("{}: unrecognised cli type '{s}'", at("cliType")))
                })?)),
                Some(_) => {
                    return Err(schema_err(&format!(
                        "{} must be a string or null",
                        at("cliType")
                    )))
                }
            };
            Ok(ChatAction::UpdateAgent {
                agent_id: required_string(obj, "agentId", &at("agentId"))?,
                name: optional_nonempty_string(obj, "name", &at("name"))?,
                instruction: optional_nonempty_string(obj, "instruction", &at("instruction"))?,
                cli_type,
                order: optional_order(obj, "order", &at("order"))?,
            })
        }
        "delete_agent" => Ok(ChatAction::DeleteAgent {
            agent_id: required_string(obj, "agentId", &at("agentId"))?,
        }),
        "reorder_agents" => {
            let list = obj
                .get("agentIds")
                .and_then(Value::as_array)
                .ok_or_else(|| schema_err(&format!("{} must be an array", at("agentIds"))))?;
            let mut agent_ids = Vec::with_capacity(list.len());
            for (j, id) in list.iter().enumerate() {
                match id.as_str() {
                    Some(s) if !s.is_empty() => agent_ids.push(s.to_string()),
                    _ => {
                        return Err(schema_err(&format!(
                            "{}[{j}] must be a non-empty string",
                            at("agentIds")
                        )))
                    }
                }
            }
            Ok(ChatAction::ReorderAgents { agent_ids })
        }
        "update_workspace" => {
            let description = match obj.get("description") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()), // may be empty
                Some(_) => {
                    return Err(schema_err(&format!(
                        "{} must be a string",
                        at("description")
                    )))
                }
            };
            Ok(ChatAction::UpdateWorkspace {
                title: optional_nonempty_string(obj, "title", &at("title"))?,
                description,
                working_directory: optional_string(obj, "workingDirectory", &at("workingDirectory"))?,
                notify_on_error: optional_bool(obj, "notifyOnError", &at("notifyOnError"))?,
                notify_on_in_review: optional_bool(
                    obj,
                    "notifyOnInReview",
                    &at("notifyOnInReview"),
                )?,
            })
        }
        "rename_chat" => Ok(ChatAction::RenameChat {
            title: required_string(obj, "title", &at("title"))?,
        }),
        other => Err(schema_err(&format!(
            "actions[{i}].type: unknown action type '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn schema_err(detail: &str) -> OutputError {
    OutputError::SchemaValidation(detail.to_string())
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    label: &str,
) -> Result<String, OutputError> {
    match obj.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(schema_err(&format!("{label} must be a non-empty string"))),
    }
}

fn optional_nonempty_string(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    label: &str,
) -> Result<Option<String>, OutputError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.clone())),
        Some(_) => Err(schema_err(&format!("{label} must be a non-empty string"))),
    }
}

fn optional_string(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    label: &str,
) -> Result<Option<String>, OutputError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(schema_err(&format!("{label} must be a string"))),
    }
}

fn optional_bool(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    label: &str,
) -> Result<Option<bool>, OutputError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(schema_err(&format!("{label} must be a boolean"))),
    }
}

fn optional_cli_kind(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    label: &str,
) -> Result<Option<CliKind>, OutputError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => CliKind::parse(s)
            .map(Some)
            .ok_or_else(|| schema_err(&format!("{label}: unrecognised cli type '{s}'"))),
        Some(_) => Err(schema_err(&format!("{label} must be a string"))),
    }
}

fn optional_order(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    label: &str,
) -> Result<Option<i64>, OutputError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n)),
            _ => Err(schema_err(&format!(
                "{label} must be a non-negative integer"
            ))),
        },
    }
}
