//! Agent rows and the agent service operations consumed by the chat action
//! executor: create with name-uniqueness and order assignment, partial
//! update, delete, full-permutation reorder, id-set validation.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ts, Agent, CliKind};
use crate::store::{Store, StoreError};

/// Partial agent update. `cli_type` distinguishes "absent" (outer `None`)
/// from an explicit clear (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub instruction: Option<String>,
    pub cli_type: Option<Option<CliKind>>,
    pub ord: Option<i64>,
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let cli: Option<String> = row.get("cli_type")?;
    Ok(Agent {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        name: row.get("name")?,
        instruction: row.get("instruction")?,
        cli_type: cli.as_deref().and_then(CliKind::parse),
        ord: row.get("ord")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    /// Agents of a workspace ordered by `ord` ascending, the task
    /// iteration sequence.
    pub fn agents_by_workspace(&self, workspace_id: &str) -> Result<Vec<Agent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM agents WHERE workspace_id = ?1 ORDER BY ord ASC")?;
        let agents = stmt
            .query_map(params![workspace_id], row_to_agent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn agent_by_id(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let conn = self.lock()?;
        let agent = conn
            .query_row("SELECT * FROM agents WHERE id = ?1", params![id], row_to_agent)
            .optional()?;
        Ok(agent)
    }

    pub fn agent_name_exists(
        &self,
        workspace_id: &str,
        name: &str,
        exclude_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agents
             WHERE workspace_id = ?1 AND name = ?2 AND id != COALESCE(?3, '')",
            params![workspace_id, name, exclude_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn max_agent_order(&self, workspace_id: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ord), 0) FROM agents WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Create an agent. Name must be unique within the workspace; a missing
    /// order appends after the current maximum.
    pub fn create_agent(
        &self,
        workspace_id: &str,
        name: &str,
        instruction: &str,
        cli_type: Option<CliKind>,
        ord: Option<i64>,
    ) -> Result<Agent, StoreError> {
        if self.agent_name_exists(workspace_id, name, None)? {
            return Err(StoreError::Conflict(format!(
                "agent name '{name}' already exists in workspace"
            )));
        }
        let ord = match ord {
            Some(o) => o,
            None => self.max_agent_order(workspace_id)? + 1,
        };
        let id = new_id();
        let now = now_ts();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO agents
                     (id, workspace_id, name, instruction, cli_type, ord, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id,
                    workspace_id,
                    name,
                    instruction,
                    cli_type.map(|c| c.as_str()),
                    ord,
                    now
                ],
            )?;
        }
        self.agent_by_id(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))
    }

    /// Apply a partial update. Name changes are checked for uniqueness
    /// against the other agents of the same workspace.
    pub fn update_agent(&self, id: &str, update: &AgentUpdate) -> Result<Agent, StoreError> {
        let agent = self
            .agent_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))?;

        if let Some(ref name) = update.name {
            if self.agent_name_exists(&agent.workspace_id, name, Some(id))? {
                return Err(StoreError::Conflict(format!(
                    "agent name '{name}' already exists in workspace"
                )));
            }
        }

        let conn = self.lock()?;
        let now = now_ts();
        if let Some(ref name) = update.name {
            conn.execute(
                "UPDATE agents SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, name, now],
            )?;
        }
        if let Some(ref instruction) = update.instruction {
            conn.execute(
                "UPDATE agents SET instruction = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, instruction, now],
            )?;
        }
        if let Some(ref cli) = update.cli_type {
            conn.execute(
                "UPDATE agents SET cli_type = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, cli.map(|c| c.as_str()), now],
            )?;
        }
        if let Some(ord) = update.ord {
            conn.execute(
                "UPDATE agents SET ord = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, ord, now],
            )?;
        }
        drop(conn);
        self.agent_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))
    }

    pub fn delete_agent(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }

    /// True iff `ids` is exactly the workspace's current agent id set.
    pub fn validate_agent_ids(
        &self,
        workspace_id: &str,
        ids: &[String],
    ) -> Result<bool, StoreError> {
        let current: std::collections::HashSet<String> = self
            .agents_by_workspace(workspace_id)?
            .into_iter()
            .map(|a| a.id)
            .collect();
        let given: std::collections::HashSet<String> = ids.iter().cloned().collect();
        Ok(given.len() == ids.len() && given == current)
    }

    /// Rewrite agent order as the permutation given by `ids` (1-based, in
    /// sequence), in one transaction. The id set must equal the workspace's
    /// current agent id set.
    pub fn reorder_agents(&self, workspace_id: &str, ids: &[String]) -> Result<(), StoreError> {
        if !self.validate_agent_ids(workspace_id, ids)? {
            return Err(StoreError::Invalid(
                "agent id list does not match the workspace's agents".into(),
            ));
        }
        let conn = self.lock()?;
        let now = now_ts();
        conn.execute_batch("BEGIN;")?;
        for (idx, id) in ids.iter().enumerate() {
            conn.execute(
                "UPDATE agents SET ord = ?2, updated_at = ?3
                 WHERE id = ?1 AND workspace_id = ?4",
                params![id, (idx + 1) as i64, now, workspace_id],
            )?;
        }
        conn.execute_batch("COMMIT;")?;
        Ok(())
    }
}
