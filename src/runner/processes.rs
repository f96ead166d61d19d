//! Subprocess registry: live CLI children by task id and chat id.
//!
//! Tracks a kill handle per running child, keyed by the work item that owns
//! it, plus the workspace for sweep kills. The handle is the sending half of
//! a oneshot channel; the owning worker `select!`s the paired receiver
//! against the child's exit, calls `start_kill` when it fires, and still
//! observes the (non-zero) exit status. Kill here is therefore fire-and-
//! forget: failures on already-exited children are swallowed.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// Paired receiver held by the worker supervising the child.
pub type KillSignal = oneshot::Receiver<()>;

struct ProcEntry {
    workspace_id: String,
    kill_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, ProcEntry>,
    chats: HashMap<String, ProcEntry>,
}

/// Owns the task and chat process maps. Cheap to share via `Arc`; one mutex,
/// short lock scopes, snapshot-then-mutate on sweep kills.
#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the child running for a task. A prior entry under the same id
    /// is killed first.
    pub fn track_task(&self, task_id: &str, workspace_id: &str) -> KillSignal {
        let (kill_tx, kill_rx) = oneshot::channel();
        let old = {
            let mut st = self.state.lock().expect("process registry lock");
            st.tasks.insert(
                task_id.to_string(),
                ProcEntry {
                    workspace_id: workspace_id.to_string(),
                    kill_tx,
                },
            )
        };
        if let Some(entry) = old {
            let _ = entry.kill_tx.send(());
        }
        kill_rx
    }

    /// Track the child running for a chat. A prior entry under the same id
    /// is killed first.
    pub fn track_chat(&self, chat_id: &str, workspace_id: &str) -> KillSignal {
        let (kill_tx, kill_rx) = oneshot::channel();
        let old = {
            let mut st = self.state.lock().expect("process registry lock");
            st.chats.insert(
                chat_id.to_string(),
                ProcEntry {
                    workspace_id: workspace_id.to_string(),
                    kill_tx,
                },
            )
        };
        if let Some(entry) = old {
            let _ = entry.kill_tx.send(());
        }
        kill_rx
    }

    /// Kill the child running for a task. Returns whether an entry existed.
    pub fn kill_task(&self, task_id: &str) -> bool {
        let entry = {
            let mut st = self.state.lock().expect("process registry lock");
            st.tasks.remove(task_id)
        };
        match entry {
            Some(e) => {
                let _ = e.kill_tx.send(());
                true
            }
            None => false,
        }
    }

    /// Kill the child running for a chat. Returns whether an entry existed.
    pub fn kill_chat(&self, chat_id: &str) -> bool {
        let entry = {
            let mut st = self.state.lock().expect("process registry lock");
            st.chats.remove(chat_id)
        };
        match entry {
            Some(e) => {
                let _ = e.kill_tx.send(());
                true
            }
            None => false,
        }
    }

    /// Kill every child whose workspace matches. Keys are snapshotted before
    /// any mutation.
    pub fn kill_workspace(&self, workspace_id: &str) -> usize {
        let entries = {
            let mut st = self.state.lock().expect("process registry lock");
            let task_keys: Vec<String> = st
                .tasks
                .iter()
                .filter(|(_, e)| e.workspace_id == workspace_id)
                .map(|(k, _)| k.clone())
                .collect();
            let chat_keys: Vec<String> = st
                .chats
                .iter()
                .filter(|(_, e)| e.workspace_id == workspace_id)
                .map(|(k, _)| k.clone())
                .collect();

            let mut removed = Vec::new();
            for k in task_keys {
                if let Some(e) = st.tasks.remove(&k) {
                    removed.push(e);
                }
            }
            for k in chat_keys {
                if let Some(e) = st.chats.remove(&k) {
                    removed.push(e);
                }
            }
            removed
        };
        let count = entries.len();
        for e in entries {
            let _ = e.kill_tx.send(());
        }
        count
    }

    /// Kill everything; used by graceful shutdown.
    pub fn kill_all(&self) -> usize {
        let entries = {
            let mut st = self.state.lock().expect("process registry lock");
            let mut removed: Vec<ProcEntry> = st.tasks.drain().map(|(_, e)| e).collect();
            removed.extend(st.chats.drain().map(|(_, e)| e));
            removed
        };
        let count = entries.len();
        for e in entries {
            let _ = e.kill_tx.send(());
        }
        count
    }

    /// Remove a task entry without killing (normal completion).
    pub fn untrack_task(&self, task_id: &str) {
        let mut st = self.state.lock().expect("process registry lock");
        st.tasks.remove(task_id);
    }

    /// Remove a chat entry without killing (normal completion).
    pub fn untrack_chat(&self, chat_id: &str) {
        let mut st = self.state.lock().expect("process registry lock");
        st.chats.remove(chat_id);
    }

    pub fn live_count(&self) -> usize {
        let st = self.state.lock().expect("process registry lock");
        st.tasks.len() + st.chats.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Track & kill ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn kill_fires_the_signal() {
        let reg = ProcessRegistry::new();
        let mut rx = reg.track_task("t1", "ws");
        assert!(reg.kill_task("t1"));
        assert!(rx.try_recv().is_ok());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn kill_missing_returns_false_without_panicking() {
        let reg = ProcessRegistry::new();
        assert!(!reg.kill_task("missing"));
        assert!(!reg.kill_chat("missing"));
    }

    #[tokio::test]
    async fn retrack_kills_the_prior_entry() {
        let reg = ProcessRegistry::new();
        let mut first = reg.track_task("t1", "ws");
        let mut second = reg.track_task("t1", "ws");
        // First child killed by the replacement; second still live.
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_err());
        assert_eq!(reg.live_count(), 1);
    }

    #[tokio::test]
    async fn untrack_removes_without_killing() {
        let reg = ProcessRegistry::new();
        let mut rx = reg.track_chat("c1", "ws");
        reg.untrack_chat("c1");
        assert_eq!(reg.live_count(), 0);
        // Sender dropped, not fired: the receiver sees Closed, not a value.
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    // ── Sweeps ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn kill_workspace_only_hits_matching_entries() {
        let reg = ProcessRegistry::new();
        let mut a = reg.track_task("t1", "ws-a");
        let mut b = reg.track_chat("c1", "ws-a");
        let mut other = reg.track_task("t2", "ws-b");

        assert_eq!(reg.kill_workspace("ws-a"), 2);
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
        assert!(other.try_recv().is_err());
        assert_eq!(reg.live_count(), 1);
    }

    #[tokio::test]
    async fn kill_all_clears_both_maps() {
        let reg = ProcessRegistry::new();
        let mut a = reg.track_task("t1", "ws-a");
        let mut b = reg.track_chat("c1", "ws-b");
        assert_eq!(reg.kill_all(), 2);
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
        assert_eq!(reg.live_count(), 0);
    }

    #[tokio::test]
    async fn kill_after_worker_exit_is_swallowed() {
        let reg = ProcessRegistry::new();
        let rx = reg.track_task("t1", "ws");
        drop(rx); // worker already gone
        assert!(reg.kill_task("t1")); // entry existed; failed send swallowed
    }
}
