//! Workspace rows: finders, partial updates, activity bump.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ts, WorkingDirMode, Workspace};
use crate::store::{Store, StoreError};

/// Partial workspace update; only present fields are written.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub working_dir_path: Option<String>,
    pub notify_on_error: Option<bool>,
    pub notify_on_in_review: Option<bool>,
}

impl WorkspaceUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.working_dir_path.is_none()
            && self.notify_on_error.is_none()
            && self.notify_on_in_review.is_none()
    }
}

fn row_to_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    let mode: String = row.get("working_dir_mode")?;
    Ok(Workspace {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        working_dir_mode: WorkingDirMode::parse(&mode).unwrap_or(WorkingDirMode::Temp),
        working_dir_path: row.get("working_dir_path")?,
        auto_delete_done_tasks: row.get::<_, i64>("auto_delete_done_tasks")? != 0,
        retention_days: row.get("retention_days")?,
        notify_on_error: row.get::<_, i64>("notify_on_error")? != 0,
        notify_on_in_review: row.get::<_, i64>("notify_on_in_review")? != 0,
        last_activity_at: row.get("last_activity_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn workspace_by_id(&self, id: &str) -> Result<Option<Workspace>, StoreError> {
        let conn = self.lock()?;
        let ws = conn
            .query_row(
                "SELECT * FROM workspaces WHERE id = ?1",
                params![id],
                row_to_workspace,
            )
            .optional()?;
        Ok(ws)
    }

    pub fn create_workspace(
        &self,
        title: &str,
        working_dir_path: Option<&str>,
    ) -> Result<Workspace, StoreError> {
        let conn = self.lock()?;
        let now = now_ts();
        let id = new_id();
        let mode = match working_dir_path {
            Some(_) => WorkingDirMode::Static,
            None => WorkingDirMode::Temp,
        };
        conn.execute(
            "INSERT INTO workspaces
                 (id, title, working_dir_mode, working_dir_path,
                  last_activity_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)",
            params![id, title, mode.as_str(), working_dir_path, now],
        )?;
        drop(conn);
        self.workspace_by_id(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("workspace {id}")))
    }

    /// Apply a partial update; no-op when every field is absent.
    pub fn update_workspace(
        &self,
        id: &str,
        update: &WorkspaceUpdate,
    ) -> Result<Workspace, StoreError> {
        if self.workspace_by_id(id)?.is_none() {
            return Err(StoreError::NotFound(format!("workspace {id}")));
        }
        if !update.is_empty() {
            let conn = self.lock()?;
            let now = now_ts();
            if let Some(ref title) = update.title {
                conn.execute(
                    "UPDATE workspaces SET title = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, title, now],
                )?;
            }
            if let Some(ref description) = update.description {
                conn.execute(
                    "UPDATE workspaces SET description = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, description, now],
                )?;
            }
            if let Some(ref path) = update.working_dir_path {
                conn.execute(
                    "UPDATE workspaces SET working_dir_path = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, path, now],
                )?;
            }
            if let Some(notify) = update.notify_on_error {
                conn.execute(
                    "UPDATE workspaces SET notify_on_error = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, notify as i64, now],
                )?;
            }
            if let Some(notify) = update.notify_on_in_review {
                conn.execute(
                    "UPDATE workspaces SET notify_on_in_review = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, notify as i64, now],
                )?;
            }
        }
        self.workspace_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("workspace {id}")))
    }

    /// Bump `last_activity_at` to now. Missing workspace is a no-op (it may
    /// have been deleted under a running worker).
    pub fn touch_workspace_activity(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE workspaces SET last_activity_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        (tmp, store)
    }

    // ── Create & find ────────────────────────────────────────────────────────

    #[test]
    fn create_and_find() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("My Project", None).unwrap();
        assert_eq!(ws.title, "My Project");
        assert_eq!(ws.working_dir_mode, WorkingDirMode::Temp);
        assert!(ws.working_dir_path.is_none());

        let found = store.workspace_by_id(&ws.id).unwrap().unwrap();
        assert_eq!(found.id, ws.id);
        assert_eq!(found.title, "My Project");
    }

    #[test]
    fn create_with_static_working_dir() {
        let (_tmp, store) = temp_store();
        let ws = store
            .create_workspace("Repo", Some("/home/dev/repo"))
            .unwrap();
        assert_eq!(ws.working_dir_mode, WorkingDirMode::Static);
        assert_eq!(ws.working_dir_path.as_deref(), Some("/home/dev/repo"));
    }

    #[test]
    fn find_missing_returns_none() {
        let (_tmp, store) = temp_store();
        assert!(store.workspace_by_id("nope").unwrap().is_none());
    }

    // ── Partial update ───────────────────────────────────────────────────────

    #[test]
    fn update_only_present_fields() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("Before", None).unwrap();

        let updated = store
            .update_workspace(
                &ws.id,
                &WorkspaceUpdate {
                    title: Some("After".into()),
                    notify_on_error: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "After");
        assert!(updated.notify_on_error);
        // Untouched fields keep their values.
        assert_eq!(updated.description, "");
        assert!(!updated.notify_on_in_review);
    }

    #[test]
    fn update_empty_is_noop() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        let updated = store
            .update_workspace(&ws.id, &WorkspaceUpdate::default())
            .unwrap();
        assert_eq!(updated.updated_at, ws.updated_at);
    }

    #[test]
    fn update_missing_is_not_found() {
        let (_tmp, store) = temp_store();
        let err = store
            .update_workspace("missing", &WorkspaceUpdate::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn update_description_may_be_empty() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        store
            .update_workspace(
                &ws.id,
                &WorkspaceUpdate {
                    description: Some("docs".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let updated = store
            .update_workspace(
                &ws.id,
                &WorkspaceUpdate {
                    description: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.description, "");
    }

    // ── Activity bump ────────────────────────────────────────────────────────

    #[test]
    fn touch_activity_advances_timestamp() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.touch_workspace_activity(&ws.id).unwrap();
        let after = store.workspace_by_id(&ws.id).unwrap().unwrap();
        assert!(after.last_activity_at > ws.last_activity_at);
    }

    #[test]
    fn touch_activity_missing_is_noop() {
        let (_tmp, store) = temp_store();
        store.touch_workspace_activity("missing").unwrap();
    }
}
