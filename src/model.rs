//! Entities and enum domains shared by the store and the runner.

use serde::{Deserialize, Serialize};

/// Current UTC time as RFC 3339 with millisecond precision.
///
/// Stored in TEXT columns; lexicographic order equals chronological order,
/// which the queue ranking relies on.
pub fn now_ts() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Fresh UUID v4 entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Enum domains
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "in_review" => Some(Self::InReview),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared status domain of task and chat queue rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The external CLI program an agent runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliKind {
    Claude,
    Gemini,
    Codex,
    Opencode,
}

impl CliKind {
    pub const ALL: [CliKind; 4] = [Self::Claude, Self::Gemini, Self::Codex, Self::Opencode];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "codex" => Some(Self::Codex),
            "opencode" => Some(Self::Opencode),
            _ => None,
        }
    }

    /// Binary name on PATH; identical to the wire name for all known kinds.
    pub fn binary(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for CliKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    User,
    Agent,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Agent,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Where a workspace's CLI subprocesses run: a fixed directory or the
/// service temp dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingDirMode {
    Static,
    Temp,
}

impl WorkingDirMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Temp => "temp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(Self::Static),
            "temp" => Some(Self::Temp),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: String,
    pub title: String,
    pub description: String,
    pub working_dir_mode: WorkingDirMode,
    pub working_dir_path: Option<String>,
    pub auto_delete_done_tasks: bool,
    pub retention_days: i64,
    pub notify_on_error: bool,
    pub notify_on_in_review: bool,
    pub last_activity_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// An ordered entry within a workspace binding a CLI kind to an instruction.
/// `ord` defines the task iteration sequence. A `None` CLI kind resolves to
/// the first healthy CLI at invocation time.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub instruction: String,
    pub cli_type: Option<CliKind>,
    pub ord: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub summary: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// `agent_id == None && user_id == None` denotes a system comment.
#[derive(Debug, Clone)]
pub struct TaskComment {
    pub id: String,
    pub task_id: String,
    pub workspace_id: String,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Append-only activity log row. `metadata` is a JSON blob.
#[derive(Debug, Clone)]
pub struct TaskLog {
    pub id: String,
    pub task_id: String,
    pub workspace_id: String,
    pub event_type: String,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct TaskQueueItem {
    pub id: String,
    pub task_id: String,
    pub workspace_id: String,
    pub status: QueueStatus,
    pub is_priority: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// `agent_id == None` selects the built-in management agent; `cli_type`
/// overrides the agent's kind when set.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: String,
    pub workspace_id: String,
    pub agent_id: Option<String>,
    pub cli_type: Option<CliKind>,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/// `actions` holds the JSON-serialized action array from CLI output, or None.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub message: String,
    pub actions: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ChatQueueItem {
    pub id: String,
    pub chat_id: String,
    pub workspace_id: String,
    pub status: QueueStatus,
    pub created_at: String,
    pub updated_at: String,
}
