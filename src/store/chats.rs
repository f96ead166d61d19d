//! Chat rows and their ordered message transcript.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ts, Chat, ChatMessage, CliKind, MessageRole};
use crate::store::{Store, StoreError};

fn row_to_chat(row: &Row<'_>) -> rusqlite::Result<Chat> {
    let cli: Option<String> = row.get("cli_type")?;
    Ok(Chat {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        agent_id: row.get("agent_id")?,
        cli_type: cli.as_deref().and_then(CliKind::parse),
        title: row.get("title")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get("role")?;
    Ok(ChatMessage {
        id: row.get("id")?,
        chat_id: row.get("chat_id")?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
        message: row.get("message")?,
        actions: row.get("actions")?,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    pub fn chat_by_id(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        let conn = self.lock()?;
        let chat = conn
            .query_row("SELECT * FROM chats WHERE id = ?1", params![id], row_to_chat)
            .optional()?;
        Ok(chat)
    }

    /// `agent_id == None` creates a management-agent chat.
    pub fn create_chat(
        &self,
        workspace_id: &str,
        agent_id: Option<&str>,
        cli_type: Option<CliKind>,
        title: &str,
    ) -> Result<Chat, StoreError> {
        let id = new_id();
        let now = now_ts();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO chats
                     (id, workspace_id, agent_id, cli_type, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id,
                    workspace_id,
                    agent_id,
                    cli_type.map(|c| c.as_str()),
                    title,
                    now
                ],
            )?;
        }
        self.chat_by_id(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("chat {id}")))
    }

    /// Delete a chat; messages and queue rows cascade with it.
    pub fn delete_chat(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn update_chat_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE chats SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, title, now_ts()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("chat {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn create_chat_message(
        &self,
        chat_id: &str,
        role: MessageRole,
        message: &str,
        actions: Option<&str>,
    ) -> Result<ChatMessage, StoreError> {
        let id = new_id();
        let now = now_ts();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chat_messages (id, chat_id, role, message, actions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, chat_id, role.as_str(), message, actions, now],
        )?;
        let msg = conn.query_row(
            "SELECT * FROM chat_messages WHERE id = ?1",
            params![id],
            row_to_message,
        )?;
        Ok(msg)
    }

    /// Full transcript, `created_at` ascending, the context-build order.
    pub fn messages_by_chat(&self, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM chat_messages WHERE chat_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let messages = stmt
            .query_map(params![chat_id], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Number of `role='agent'` messages; gates the first-response rename.
    pub fn count_agent_messages(&self, chat_id: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE chat_id = ?1 AND role = 'agent'",
            params![chat_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// True when the chat has a queue row still `queued` or `in_progress`.
    pub fn has_active_queue_item(&self, chat_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_queue
             WHERE chat_id = ?1 AND status IN ('queued', 'in_progress')",
            params![chat_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
