//! Task rows, comments, and the append-only activity log.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ts, ActorType, Task, TaskComment, TaskLog, TaskStatus};
use crate::store::{Store, StoreError};

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    Ok(Task {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        summary: row.get("summary")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Todo),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_comment(row: &Row<'_>) -> rusqlite::Result<TaskComment> {
    Ok(TaskComment {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        workspace_id: row.get("workspace_id")?,
        user_id: row.get("user_id")?,
        agent_id: row.get("agent_id")?,
        content: row.get("content")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<TaskLog> {
    let actor: String = row.get("actor_type")?;
    Ok(TaskLog {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        workspace_id: row.get("workspace_id")?,
        event_type: row.get("event_type")?,
        actor_type: ActorType::parse(&actor).unwrap_or(ActorType::System),
        actor_id: row.get("actor_id")?,
        metadata: row.get("metadata")?,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    pub fn task_by_id(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        let task = conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()?;
        Ok(task)
    }

    pub fn create_task(
        &self,
        workspace_id: &str,
        summary: &str,
        description: &str,
    ) -> Result<Task, StoreError> {
        let id = new_id();
        let now = now_ts();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO tasks (id, workspace_id, summary, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, workspace_id, summary, description, now],
            )?;
        }
        self.task_by_id(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_ts()],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Comments
    // -----------------------------------------------------------------------

    pub fn create_task_comment(
        &self,
        task_id: &str,
        workspace_id: &str,
        user_id: Option<&str>,
        agent_id: Option<&str>,
        content: &str,
    ) -> Result<TaskComment, StoreError> {
        let id = new_id();
        let now = now_ts();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_comments
                 (id, task_id, workspace_id, user_id, agent_id, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![id, task_id, workspace_id, user_id, agent_id, content, now],
        )?;
        let comment = conn.query_row(
            "SELECT * FROM task_comments WHERE id = ?1",
            params![id],
            row_to_comment,
        )?;
        Ok(comment)
    }

    pub fn comments_by_task(&self, task_id: &str) -> Result<Vec<TaskComment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM task_comments WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let comments = stmt
            .query_map(params![task_id], row_to_comment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(comments)
    }

    // -----------------------------------------------------------------------
    // Activity log
    // -----------------------------------------------------------------------

    pub fn create_task_log(
        &self,
        task_id: &str,
        workspace_id: &str,
        event_type: &str,
        actor_type: ActorType,
        actor_id: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<TaskLog, StoreError> {
        let id = new_id();
        let now = now_ts();
        let metadata = metadata.map(|m| m.to_string());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_logs
                 (id, task_id, workspace_id, event_type, actor_type, actor_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                task_id,
                workspace_id,
                event_type,
                actor_type.as_str(),
                actor_id,
                metadata,
                now
            ],
        )?;
        let log = conn.query_row(
            "SELECT * FROM task_logs WHERE id = ?1",
            params![id],
            row_to_log,
        )?;
        Ok(log)
    }

    pub fn logs_by_task(&self, task_id: &str) -> Result<Vec<TaskLog>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM task_logs WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let logs = stmt
            .query_map(params![task_id], row_to_log)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }
}
