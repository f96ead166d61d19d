//! Runner scheduler: two polling loops (tasks, chats), per-workspace task
//! serialization, per-chat serialization, startup recovery, graceful stop.
//!
//! Each poll may launch several workers; a worker is an independent tokio
//! task that spends nearly all its time awaiting an external CLI subprocess.
//! At most one task worker runs per workspace and one chat worker per chat
//! at any instant; there is no global worker cap. Scheduler errors never
//! escape; they are logged and the workspace/chat simply retries next tick.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::EventBus;
use crate::model::{TaskQueueItem, TaskStatus, WorkingDirMode, Workspace};
use crate::runner::cli::CliAdapter;
use crate::runner::processes::ProcessRegistry;
use crate::store::{Store, StoreError};

pub mod chat_actions;
pub mod chat_worker;
pub mod cli;
pub mod input;
pub mod output;
pub mod processes;
pub mod task_actions;
pub mod task_worker;

const SHUTDOWN_QUIESCE: Duration = Duration::from_secs(1);

/// Everything a worker needs, shared across the scheduler and every spawned
/// worker task.
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub processes: Arc<ProcessRegistry>,
    pub cli: Arc<CliAdapter>,
    pub temp_dir: PathBuf,
    pub mailgun_configured: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} no longer exists")]
    Missing(String),
    #[error("{0}")]
    Cli(String),
}

/// `static` mode runs the child in the workspace's configured directory,
/// falling back to the temp dir when the path was never set.
pub(crate) fn resolve_working_dir(workspace: &Workspace, temp_dir: &Path) -> PathBuf {
    match workspace.working_dir_mode {
        WorkingDirMode::Static => workspace
            .working_dir_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| temp_dir.to_path_buf()),
        WorkingDirMode::Temp => temp_dir.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Pickup ranking
// ---------------------------------------------------------------------------

/// Select the next task queue row for a workspace, ranked:
/// 1. any priority row;
/// 2. the row continuing the most recently finished task (a pipeline that
///    was mid-flight keeps going);
/// 3. the most recently updated row (LIFO fallback).
///
/// Rows whose task is gone or already `in_review`/`done` are ignored.
pub fn pick_next_task_queue_item(
    store: &Store,
    workspace_id: &str,
) -> Result<Option<TaskQueueItem>, StoreError> {
    let queued = store.queued_task_items_by_workspace(workspace_id)?;
    let mut eligible = Vec::with_capacity(queued.len());
    for item in queued {
        if let Some(task) = store.task_by_id(&item.task_id)? {
            if matches!(task.status, TaskStatus::Todo | TaskStatus::InProgress) {
                eligible.push(item);
            }
        }
    }
    if eligible.is_empty() {
        return Ok(None);
    }

    if let Some(priority) = eligible.iter().find(|i| i.is_priority) {
        return Ok(Some(priority.clone()));
    }
    if let Some(last_task_id) = store.last_finished_task_id(workspace_id)? {
        if let Some(cont) = eligible.iter().find(|i| i.task_id == last_task_id) {
            return Ok(Some(cont.clone()));
        }
    }
    // `queued_task_items_by_workspace` returns most recent first.
    Ok(Some(eligible[0].clone()))
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

struct RunnerState {
    is_running: bool,
    is_shutting_down: bool,
    shutdown_tx: Option<watch::Sender<bool>>,
    poll_handles: Vec<JoinHandle<()>>,
}

struct RunnerInner {
    ctx: RunnerContext,
    poll_interval: Duration,
    active_task_workspaces: Mutex<HashSet<String>>,
    active_chats: Mutex<HashSet<String>>,
    state: Mutex<RunnerState>,
}

/// The orchestrator: owns the poll loops and the active-work sets.
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(ctx: RunnerContext, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                ctx,
                poll_interval,
                active_task_workspaces: Mutex::new(HashSet::new()),
                active_chats: Mutex::new(HashSet::new()),
                state: Mutex::new(RunnerState {
                    is_running: false,
                    is_shutting_down: false,
                    shutdown_tx: None,
                    poll_handles: Vec::new(),
                }),
            }),
        }
    }

    pub fn context(&self) -> &RunnerContext {
        &self.inner.ctx
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().expect("runner state lock").is_running
    }

    pub fn active_task_workspace_count(&self) -> usize {
        self.inner
            .active_task_workspaces
            .lock()
            .expect("runner active set lock")
            .len()
    }

    pub fn active_chat_count(&self) -> usize {
        self.inner
            .active_chats
            .lock()
            .expect("runner active set lock")
            .len()
    }

    /// Recover abandoned rows, then start both poll loops. The first poll of
    /// each loop runs immediately. Idempotent while running.
    pub async fn start(&self) -> Result<(), StoreError> {
        {
            let mut st = self.inner.state.lock().expect("runner state lock");
            if st.is_running {
                return Ok(());
            }
            st.is_running = true;
            st.is_shutting_down = false;
        }

        // Startup recovery: anything left in_progress by a previous process
        // goes back to queued, with updated_at refreshed so LIFO pickup
        // prefers the work that was just interrupted.
        let recovered = self
            .inner
            .ctx
            .store
            .reset_in_progress_task_queue()
            .and_then(|tasks| {
                let chats = self.inner.ctx.store.reset_in_progress_chat_queue()?;
                Ok((tasks, chats))
            });
        let (tasks_reset, chats_reset) = match recovered {
            Ok(counts) => counts,
            Err(e) => {
                let mut st = self.inner.state.lock().expect("runner state lock");
                st.is_running = false;
                return Err(e);
            }
        };
        if tasks_reset > 0 || chats_reset > 0 {
            tracing::info!(tasks_reset, chats_reset, "recovered interrupted queue rows");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(task_poll_loop(
            Arc::clone(&self.inner),
            shutdown_rx.clone(),
        ));
        let chat_handle = tokio::spawn(chat_poll_loop(Arc::clone(&self.inner), shutdown_rx));

        let mut st = self.inner.state.lock().expect("runner state lock");
        st.shutdown_tx = Some(shutdown_tx);
        st.poll_handles = vec![task_handle, chat_handle];
        tracing::info!(poll_interval_ms = self.inner.poll_interval.as_millis() as u64, "runner started");
        Ok(())
    }

    /// Graceful shutdown: stop the pollers, kill every live subprocess,
    /// then wait briefly so unwinding workers can finalize their rows.
    pub async fn stop(&self) {
        let handles = {
            let mut st = self.inner.state.lock().expect("runner state lock");
            if !st.is_running {
                return;
            }
            st.is_shutting_down = true;
            if let Some(tx) = st.shutdown_tx.take() {
                let _ = tx.send(true);
            }
            std::mem::take(&mut st.poll_handles)
        };

        let killed = self.inner.ctx.processes.kill_all();
        if killed > 0 {
            tracing::info!(killed, "terminated live subprocesses");
        }

        // Let kills deliver and workers mark their rows before we return.
        tokio::time::sleep(SHUTDOWN_QUIESCE).await;

        for handle in handles {
            handle.abort();
        }
        let mut st = self.inner.state.lock().expect("runner state lock");
        st.is_running = false;
        st.is_shutting_down = false;
        tracing::info!("runner stopped");
    }
}

// ---------------------------------------------------------------------------
// Poll loops
// ---------------------------------------------------------------------------

async fn task_poll_loop(inner: Arc<RunnerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if *shutdown.borrow() {
                    return;
                }
                if let Err(e) = poll_tasks_once(&inner) {
                    tracing::error!(error = %e, "task poll failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn chat_poll_loop(inner: Arc<RunnerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if *shutdown.borrow() {
                    return;
                }
                if let Err(e) = poll_chats_once(&inner) {
                    tracing::error!(error = %e, "chat poll failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// One task poll: for each workspace with queued rows and no active worker,
/// reserve the slot, pick a row, spawn a worker. The worker frees the slot
/// when it returns, success or not.
fn poll_tasks_once(inner: &Arc<RunnerInner>) -> Result<(), StoreError> {
    let workspace_ids = inner.ctx.store.queued_task_workspace_ids()?;
    for workspace_id in workspace_ids {
        {
            let mut active = inner
                .active_task_workspaces
                .lock()
                .expect("runner active set lock");
            if !active.insert(workspace_id.clone()) {
                continue;
            }
        }

        let item = match pick_next_task_queue_item(&inner.ctx.store, &workspace_id) {
            Ok(Some(item)) => item,
            Ok(None) => {
                release_task_slot(inner, &workspace_id);
                continue;
            }
            Err(e) => {
                release_task_slot(inner, &workspace_id);
                tracing::error!(workspace = %workspace_id, error = %e, "task pickup failed");
                continue;
            }
        };

        let worker_inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(e) = task_worker::process_task(&worker_inner.ctx, &item).await {
                tracing::warn!(task = %item.task_id, error = %e, "task worker failed");
            }
            release_task_slot(&worker_inner, &item.workspace_id);
        });
    }
    Ok(())
}

fn release_task_slot(inner: &Arc<RunnerInner>, workspace_id: &str) {
    inner
        .active_task_workspaces
        .lock()
        .expect("runner active set lock")
        .remove(workspace_id);
}

/// One chat poll: queued rows FIFO by creation; one worker per chat.
fn poll_chats_once(inner: &Arc<RunnerInner>) -> Result<(), StoreError> {
    let items = inner.ctx.store.queued_chat_items()?;
    for item in items {
        {
            let mut active = inner.active_chats.lock().expect("runner active set lock");
            if !active.insert(item.chat_id.clone()) {
                continue;
            }
        }

        let worker_inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(e) = chat_worker::process_chat(&worker_inner.ctx, &item).await {
                tracing::warn!(chat = %item.chat_id, error = %e, "chat worker failed");
            }
            worker_inner
                .active_chats
                .lock()
                .expect("runner active set lock")
                .remove(&item.chat_id);
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueueStatus;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn pause() {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    // ── Pickup ranking ───────────────────────────────────────────────────────

    #[test]
    fn pick_none_when_queue_empty() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        assert!(pick_next_task_queue_item(&store, &ws.id).unwrap().is_none());
    }

    #[test]
    fn pick_skips_rows_for_finished_or_deleted_tasks() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        let done = store.create_task(&ws.id, "Done", "").unwrap();
        store.update_task_status(&done.id, TaskStatus::Done).unwrap();
        store.enqueue_task(&done.id, &ws.id, false).unwrap();

        let gone = store.create_task(&ws.id, "Gone", "").unwrap();
        store.enqueue_task(&gone.id, &ws.id, false).unwrap();
        store.delete_task(&gone.id).unwrap();

        assert!(pick_next_task_queue_item(&store, &ws.id).unwrap().is_none());
    }

    #[test]
    fn pick_prefers_priority() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        let a = store.create_task(&ws.id, "A", "").unwrap();
        let b = store.create_task(&ws.id, "B", "").unwrap();
        store.enqueue_task(&a.id, &ws.id, false).unwrap();
        pause();
        let priority = store.enqueue_task(&b.id, &ws.id, true).unwrap();

        let picked = pick_next_task_queue_item(&store, &ws.id).unwrap().unwrap();
        assert_eq!(picked.id, priority.id);
    }

    #[test]
    fn pick_continues_last_finished_task() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        let pipeline = store.create_task(&ws.id, "Pipeline", "").unwrap();
        let other = store.create_task(&ws.id, "Other", "").unwrap();

        // A finished run of `pipeline` exists.
        let finished = store.enqueue_task(&pipeline.id, &ws.id, false).unwrap();
        store
            .update_task_queue_status(&finished.id, QueueStatus::Completed)
            .unwrap();

        pause();
        let continuation = store.enqueue_task(&pipeline.id, &ws.id, false).unwrap();
        pause();
        // `other` is newer, so plain LIFO would choose it.
        store.enqueue_task(&other.id, &ws.id, false).unwrap();

        let picked = pick_next_task_queue_item(&store, &ws.id).unwrap().unwrap();
        assert_eq!(picked.id, continuation.id);
    }

    #[test]
    fn pick_falls_back_to_lifo() {
        let (_tmp, store) = temp_store();
        let ws = store.create_workspace("W", None).unwrap();
        let a = store.create_task(&ws.id, "A", "").unwrap();
        let b = store.create_task(&ws.id, "B", "").unwrap();
        store.enqueue_task(&a.id, &ws.id, false).unwrap();
        pause();
        let newest = store.enqueue_task(&b.id, &ws.id, false).unwrap();

        let picked = pick_next_task_queue_item(&store, &ws.id).unwrap().unwrap();
        assert_eq!(picked.id, newest.id);
    }

    // ── Working dir resolution ───────────────────────────────────────────────

    #[test]
    fn working_dir_follows_mode() {
        let (_tmp, store) = temp_store();
        let temp_dir = Path::new("/tmp/malamar");

        let ws = store.create_workspace("Temp", None).unwrap();
        assert_eq!(resolve_working_dir(&ws, temp_dir), temp_dir);

        let ws = store.create_workspace("Static", Some("/srv/repo")).unwrap();
        assert_eq!(
            resolve_working_dir(&ws, temp_dir),
            PathBuf::from("/srv/repo")
        );

        // Static mode with the path unset falls back to temp.
        let mut ws = store.create_workspace("Broken", Some("/srv/x")).unwrap();
        ws.working_dir_path = None;
        assert_eq!(resolve_working_dir(&ws, temp_dir), temp_dir);
    }
}
