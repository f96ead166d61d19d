//! SQLite store: schema init, connection guard, per-entity repositories.
//!
//! Lives at `<data_dir>/malamar.db`.
//!
//! Tables (all owned transitively by `workspaces` through cascading FKs):
//! - `workspaces`    — top-level tenant
//! - `agents`        — ordered agents per workspace
//! - `tasks`         — structured work units with a 4-state lifecycle
//! - `task_comments` — user/agent/system comments per task
//! - `task_logs`     — append-only activity log
//! - `task_queue`    — runner work items per task
//! - `chats`         — conversational sessions
//! - `chat_messages` — ordered chat transcript
//! - `chat_queue`    — runner work items per chat

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

pub mod agents;
pub mod chat_queue;
pub mod chats;
pub mod task_queue;
pub mod tasks;
pub mod workspaces;

pub const DB_FILE: &str = "malamar.db";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("db io: {0}")]
    Io(#[from] std::io::Error),
    #[error("db lock poisoned")]
    Lock,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persistent SQLite store for Malamar.
///
/// Uses a single `Mutex<Connection>`; safe to share across async tasks via
/// `Arc<Store>` since all operations take the lock synchronously.
/// (rusqlite `Connection` is `Send` but not `Sync`.)
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at `<data_dir>/malamar.db`.
    /// Creates `data_dir` if it does not exist.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;

        // WAL + NORMAL sync: durable with fast concurrent-reader writes.
        // foreign_keys ON: workspace deletes cascade through all child rows.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Health check: execute a trivial query.
    pub fn health_check(&self) -> bool {
        self.conn
            .lock()
            .map(|c| c.execute_batch("SELECT 1").is_ok())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workspaces (
                id                     TEXT PRIMARY KEY,
                title                  TEXT NOT NULL,
                description            TEXT NOT NULL DEFAULT '',
                working_dir_mode       TEXT NOT NULL DEFAULT 'temp'
                    CHECK (working_dir_mode IN ('static', 'temp')),
                working_dir_path       TEXT,
                auto_delete_done_tasks INTEGER NOT NULL DEFAULT 0,
                retention_days         INTEGER NOT NULL DEFAULT 30,
                notify_on_error        INTEGER NOT NULL DEFAULT 0,
                notify_on_in_review    INTEGER NOT NULL DEFAULT 0,
                last_activity_at       TEXT NOT NULL,
                created_at             TEXT NOT NULL,
                updated_at             TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id           TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name         TEXT NOT NULL,
                instruction  TEXT NOT NULL,
                cli_type     TEXT
                    CHECK (cli_type IS NULL OR cli_type IN ('claude', 'gemini', 'codex', 'opencode')),
                ord          INTEGER NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                UNIQUE (workspace_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_agents_workspace
                ON agents(workspace_id, ord);

            CREATE TABLE IF NOT EXISTS tasks (
                id           TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                summary      TEXT NOT NULL,
                description  TEXT NOT NULL DEFAULT '',
                status       TEXT NOT NULL DEFAULT 'todo'
                    CHECK (status IN ('todo', 'in_progress', 'in_review', 'done')),
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_workspace
                ON tasks(workspace_id, status);

            CREATE TABLE IF NOT EXISTS task_comments (
                id           TEXT PRIMARY KEY,
                task_id      TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                user_id      TEXT,
                agent_id     TEXT,
                content      TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_comments_task
                ON task_comments(task_id, created_at);

            CREATE TABLE IF NOT EXISTS task_logs (
                id           TEXT PRIMARY KEY,
                task_id      TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                event_type   TEXT NOT NULL,
                actor_type   TEXT NOT NULL
                    CHECK (actor_type IN ('user', 'agent', 'system')),
                actor_id     TEXT,
                metadata     TEXT,
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_logs_task
                ON task_logs(task_id, created_at);

            CREATE TABLE IF NOT EXISTS task_queue (
                id           TEXT PRIMARY KEY,
                task_id      TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                status       TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued', 'in_progress', 'completed', 'failed')),
                is_priority  INTEGER NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_queue_workspace
                ON task_queue(workspace_id, status);

            CREATE TABLE IF NOT EXISTS chats (
                id           TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                agent_id     TEXT REFERENCES agents(id) ON DELETE SET NULL,
                cli_type     TEXT
                    CHECK (cli_type IS NULL OR cli_type IN ('claude', 'gemini', 'codex', 'opencode')),
                title        TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                id         TEXT PRIMARY KEY,
                chat_id    TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                role       TEXT NOT NULL
                    CHECK (role IN ('user', 'agent', 'system')),
                message    TEXT NOT NULL,
                actions    TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
                ON chat_messages(chat_id, created_at);

            CREATE TABLE IF NOT EXISTS chat_queue (
                id           TEXT PRIMARY KEY,
                chat_id      TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                status       TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued', 'in_progress', 'completed', 'failed')),
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_queue_status
                ON chat_queue(status, created_at);",
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
