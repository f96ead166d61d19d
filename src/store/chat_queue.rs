//! Chat queue rows: enqueue, FIFO finder, atomic claim, startup recovery.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ts, ChatQueueItem, QueueStatus};
use crate::store::{Store, StoreError};

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ChatQueueItem> {
    let status: String = row.get("status")?;
    Ok(ChatQueueItem {
        id: row.get("id")?,
        chat_id: row.get("chat_id")?,
        workspace_id: row.get("workspace_id")?,
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Queued),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn enqueue_chat(
        &self,
        chat_id: &str,
        workspace_id: &str,
    ) -> Result<ChatQueueItem, StoreError> {
        let id = new_id();
        let now = now_ts();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chat_queue (id, chat_id, workspace_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, chat_id, workspace_id, now],
        )?;
        let item = conn.query_row(
            "SELECT * FROM chat_queue WHERE id = ?1",
            params![id],
            row_to_item,
        )?;
        Ok(item)
    }

    pub fn chat_queue_item_by_id(&self, id: &str) -> Result<Option<ChatQueueItem>, StoreError> {
        let conn = self.lock()?;
        let item = conn
            .query_row(
                "SELECT * FROM chat_queue WHERE id = ?1",
                params![id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// All queued rows, FIFO by creation.
    pub fn queued_chat_items(&self) -> Result<Vec<ChatQueueItem>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM chat_queue WHERE status = 'queued'
             ORDER BY created_at ASC, id ASC",
        )?;
        let items = stmt
            .query_map([], row_to_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn in_progress_chat_item(
        &self,
        chat_id: &str,
    ) -> Result<Option<ChatQueueItem>, StoreError> {
        let conn = self.lock()?;
        let item = conn
            .query_row(
                "SELECT * FROM chat_queue WHERE chat_id = ?1 AND status = 'in_progress'",
                params![chat_id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Atomic claim: advance `queued → in_progress` in one statement.
    /// Returns false when another spawner already claimed the row.
    pub fn claim_chat_queue_item(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE chat_queue SET status = 'in_progress', updated_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id, now_ts()],
        )?;
        Ok(changed == 1)
    }

    pub fn update_chat_queue_status(
        &self,
        id: &str,
        status: QueueStatus,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE chat_queue SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_ts()],
        )?;
        Ok(())
    }

    /// Startup recovery: every `in_progress` row back to `queued` in one
    /// update, refreshing `updated_at`.
    pub fn reset_in_progress_chat_queue(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE chat_queue SET status = 'queued', updated_at = ?1
             WHERE status = 'in_progress'",
            params![now_ts()],
        )?;
        Ok(changed)
    }
}
