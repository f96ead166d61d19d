//! Task queue rows: enqueue, finders, atomic claim, startup recovery.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ts, QueueStatus, TaskQueueItem};
use crate::store::{Store, StoreError};

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<TaskQueueItem> {
    let status: String = row.get("status")?;
    Ok(TaskQueueItem {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        workspace_id: row.get("workspace_id")?,
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Queued),
        is_priority: row.get::<_, i64>("is_priority")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn enqueue_task(
        &self,
        task_id: &str,
        workspace_id: &str,
        is_priority: bool,
    ) -> Result<TaskQueueItem, StoreError> {
        let id = new_id();
        let now = now_ts();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_queue
                 (id, task_id, workspace_id, is_priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, task_id, workspace_id, is_priority as i64, now],
        )?;
        let item = conn.query_row(
            "SELECT * FROM task_queue WHERE id = ?1",
            params![id],
            row_to_item,
        )?;
        Ok(item)
    }

    pub fn task_queue_item_by_id(&self, id: &str) -> Result<Option<TaskQueueItem>, StoreError> {
        let conn = self.lock()?;
        let item = conn
            .query_row(
                "SELECT * FROM task_queue WHERE id = ?1",
                params![id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Distinct workspaces that currently have queued rows.
    pub fn queued_task_workspace_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT workspace_id FROM task_queue WHERE status = 'queued'")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn queued_task_items_by_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<TaskQueueItem>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM task_queue
             WHERE workspace_id = ?1 AND status = 'queued'
             ORDER BY updated_at DESC, id ASC",
        )?;
        let items = stmt
            .query_map(params![workspace_id], row_to_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Task id of the most recently finished (completed or failed) queue row
    /// in the workspace, if any; lets a mid-flight pipeline continue first.
    pub fn last_finished_task_id(&self, workspace_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let task_id = conn
            .query_row(
                "SELECT task_id FROM task_queue
                 WHERE workspace_id = ?1 AND status IN ('completed', 'failed')
                 ORDER BY updated_at DESC, id ASC
                 LIMIT 1",
                params![workspace_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(task_id)
    }

    /// Atomic claim: advance `queued → in_progress` in one statement.
    /// Returns false when another spawner already claimed the row.
    pub fn claim_task_queue_item(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE task_queue SET status = 'in_progress', updated_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id, now_ts()],
        )?;
        Ok(changed == 1)
    }

    pub fn update_task_queue_status(
        &self,
        id: &str,
        status: QueueStatus,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE task_queue SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_ts()],
        )?;
        Ok(())
    }

    /// Startup recovery: every `in_progress` row back to `queued` in one
    /// update, refreshing `updated_at` so LIFO ordering prefers recent work.
    pub fn reset_in_progress_task_queue(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE task_queue SET status = 'queued', updated_at = ?1
             WHERE status = 'in_progress'",
            params![now_ts()],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, Workspace};
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, Store, Workspace, Task) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let ws = store.create_workspace("W", None).unwrap();
        let task = store.create_task(&ws.id, "T", "").unwrap();
        (tmp, store, ws, task)
    }

    // ── Enqueue & finders ────────────────────────────────────────────────────

    #[test]
    fn enqueue_starts_queued() {
        let (_tmp, store, ws, task) = temp_store();
        let item = store.enqueue_task(&task.id, &ws.id, true).unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
        assert!(item.is_priority);
        assert_eq!(
            store.queued_task_workspace_ids().unwrap(),
            vec![ws.id.clone()]
        );
    }

    #[test]
    fn queued_items_most_recent_first() {
        let (_tmp, store, ws, task) = temp_store();
        let first = store.enqueue_task(&task.id, &ws.id, false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.enqueue_task(&task.id, &ws.id, false).unwrap();

        let items = store.queued_task_items_by_workspace(&ws.id).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, second.id);
        assert_eq!(items[1].id, first.id);
    }

    // ── Atomic claim ─────────────────────────────────────────────────────────

    #[test]
    fn claim_succeeds_once() {
        let (_tmp, store, ws, task) = temp_store();
        let item = store.enqueue_task(&task.id, &ws.id, false).unwrap();
        assert!(store.claim_task_queue_item(&item.id).unwrap());
        // Second claim loses.
        assert!(!store.claim_task_queue_item(&item.id).unwrap());
        let after = store.task_queue_item_by_id(&item.id).unwrap().unwrap();
        assert_eq!(after.status, QueueStatus::InProgress);
    }

    #[test]
    fn claim_missing_returns_false() {
        let (_tmp, store, _ws, _task) = temp_store();
        assert!(!store.claim_task_queue_item("missing").unwrap());
    }

    // ── Finished-task finder ─────────────────────────────────────────────────

    #[test]
    fn last_finished_prefers_most_recent() {
        let (_tmp, store, ws, task) = temp_store();
        let other = store.create_task(&ws.id, "Other", "").unwrap();

        let a = store.enqueue_task(&task.id, &ws.id, false).unwrap();
        store
            .update_task_queue_status(&a.id, QueueStatus::Completed)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = store.enqueue_task(&other.id, &ws.id, false).unwrap();
        store
            .update_task_queue_status(&b.id, QueueStatus::Failed)
            .unwrap();

        assert_eq!(
            store.last_finished_task_id(&ws.id).unwrap(),
            Some(other.id.clone())
        );
    }

    #[test]
    fn last_finished_none_when_no_terminal_rows() {
        let (_tmp, store, ws, task) = temp_store();
        store.enqueue_task(&task.id, &ws.id, false).unwrap();
        assert!(store.last_finished_task_id(&ws.id).unwrap().is_none());
    }

    // ── Startup recovery ─────────────────────────────────────────────────────

    #[test]
    fn recovery_resets_only_in_progress() {
        let (_tmp, store, ws, task) = temp_store();
        let stuck = store.enqueue_task(&task.id, &ws.id, false).unwrap();
        store.claim_task_queue_item(&stuck.id).unwrap();
        let done = store.enqueue_task(&task.id, &ws.id, false).unwrap();
        store
            .update_task_queue_status(&done.id, QueueStatus::Completed)
            .unwrap();
        let queued = store.enqueue_task(&task.id, &ws.id, false).unwrap();

        let reset = store.reset_in_progress_task_queue().unwrap();
        assert_eq!(reset, 1);

        assert_eq!(
            store
                .task_queue_item_by_id(&stuck.id)
                .unwrap()
                .unwrap()
                .status,
            QueueStatus::Queued
        );
        assert_eq!(
            store
                .task_queue_item_by_id(&done.id)
                .unwrap()
                .unwrap()
                .status,
            QueueStatus::Completed
        );
        assert_eq!(
            store
                .task_queue_item_by_id(&queued.id)
                .unwrap()
                .unwrap()
                .status,
            QueueStatus::Queued
        );
    }

    #[test]
    fn recovery_refreshes_updated_at() {
        let (_tmp, store, ws, task) = temp_store();
        let stuck = store.enqueue_task(&task.id, &ws.id, false).unwrap();
        store.claim_task_queue_item(&stuck.id).unwrap();
        let before = store
            .task_queue_item_by_id(&stuck.id)
            .unwrap()
            .unwrap()
            .updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.reset_in_progress_task_queue().unwrap();
        let after = store
            .task_queue_item_by_id(&stuck.id)
            .unwrap()
            .unwrap()
            .updated_at;
        assert!(after > before);
    }
}
