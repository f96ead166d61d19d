//! CLI adapter: per-kind subprocess invocation, health checks, test override.
//!
//! One invocation contract for every CLI kind: the prepared input is handed
//! to the child over its established convention (stdin for claude, gemini
//! and codex; a positional argument for opencode), stderr is captured, the
//! exit code is surfaced, and the output file named inside the input is
//! never read here; that is the parser's job after the child exits.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::model::CliKind;
use crate::runner::processes::KillSignal;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("failed to start {bin}: {source}")]
    Spawn {
        bin: &'static str,
        source: std::io::Error,
    },
    #[error("cli io: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether an invocation runs a task agent or a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Task,
    Chat,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub cli: CliKind,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub working_dir: PathBuf,
    pub kind: InvokeKind,
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub success: bool,
    /// None when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Launches the external program for one invocation. The production
/// implementation spawns the real CLI; tests substitute a scripted double
/// through [`CliAdapter::set_override`].
pub trait CliRunner: Send + Sync {
    fn invoke<'a>(
        &'a self,
        req: &'a InvokeRequest,
        kill: KillSignal,
    ) -> BoxFuture<'a, Result<InvokeOutcome, CliError>>;
}

// ---------------------------------------------------------------------------
// Real command runner
// ---------------------------------------------------------------------------

struct CommandCliRunner;

impl CliRunner for CommandCliRunner {
    fn invoke<'a>(
        &'a self,
        req: &'a InvokeRequest,
        kill: KillSignal,
    ) -> BoxFuture<'a, Result<InvokeOutcome, CliError>> {
        Box::pin(run_command(req, kill))
    }
}

async fn run_command(req: &InvokeRequest, kill: KillSignal) -> Result<InvokeOutcome, CliError> {
    let input = tokio::fs::read_to_string(&req.input_path).await?;

    let mut cmd = Command::new(req.cli.binary());
    let use_stdin = match req.cli {
        CliKind::Claude => {
            cmd.args(["-p", "--dangerously-skip-permissions"]);
            true
        }
        CliKind::Gemini => {
            cmd.arg("--yolo");
            true
        }
        CliKind::Codex => {
            cmd.args(["exec", "--full-auto", "-"]);
            true
        }
        CliKind::Opencode => {
            cmd.arg("run").arg(&input);
            false
        }
    };

    cmd.current_dir(&req.working_dir)
        .stdin(if use_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| CliError::Spawn {
        bin: req.cli.binary(),
        source: e,
    })?;

    if use_stdin {
        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits before reading breaks the pipe; the exit
            // status tells the story, so the write error is dropped.
            let _ = stdin.write_all(input.as_bytes()).await;
        }
    }

    // Drain stderr concurrently with the wait so a chatty child can't fill
    // the pipe and stall.
    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = kill => {
            // Cancellation is fire-and-forget: kill, then observe the exit.
            let _ = child.start_kill();
            child.wait().await?
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();
    Ok(InvokeOutcome {
        success: status.success(),
        exit_code: status.code(),
        stderr: stderr.trim().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Health checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: HealthState,
    pub version: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Probe one CLI kind with `<bin> --version`.
pub async fn health_check(kind: CliKind) -> HealthReport {
    health_check_binary(kind.binary()).await
}

async fn health_check_binary(bin: &str) -> HealthReport {
    let started = Instant::now();
    let result = tokio::time::timeout(
        HEALTH_CHECK_TIMEOUT,
        Command::new(bin)
            .arg("--version")
            .stdin(Stdio::null())
            .output(),
    )
    .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Err(_) => HealthReport {
            state: HealthState::Unhealthy,
            version: None,
            error: Some("health check timed out".into()),
            duration_ms,
        },
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => HealthReport {
            state: HealthState::NotFound,
            version: None,
            error: Some(format!("{bin} not found on PATH")),
            duration_ms,
        },
        Ok(Err(e)) => HealthReport {
            state: HealthState::Unhealthy,
            version: None,
            error: Some(e.to_string()),
            duration_ms,
        },
        Ok(Ok(out)) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty());
            HealthReport {
                state: HealthState::Healthy,
                version,
                error: None,
                duration_ms,
            }
        }
        Ok(Ok(out)) => HealthReport {
            state: HealthState::Unhealthy,
            version: None,
            error: Some(String::from_utf8_lossy(&out.stderr).trim().to_string()),
            duration_ms,
        },
    }
}

// ---------------------------------------------------------------------------
// Adapter: override slot + health cache
// ---------------------------------------------------------------------------

/// The runner's view of the CLI fleet: dispatches invocations (through the
/// override when one is installed) and caches the latest health report per
/// kind. Health polling itself lives outside the runner; only its results
/// are consumed here.
pub struct CliAdapter {
    default_runner: Arc<dyn CliRunner>,
    override_runner: Mutex<Option<Arc<dyn CliRunner>>>,
    health: Mutex<HashMap<CliKind, HealthReport>>,
}

impl Default for CliAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CliAdapter {
    pub fn new() -> Self {
        Self {
            default_runner: Arc::new(CommandCliRunner),
            override_runner: Mutex::new(None),
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or clear) the process-scoped test double.
    pub fn set_override(&self, runner: Option<Arc<dyn CliRunner>>) {
        *self.override_runner.lock().expect("cli override lock") = runner;
    }

    pub async fn invoke(
        &self,
        req: &InvokeRequest,
        kill: KillSignal,
    ) -> Result<InvokeOutcome, CliError> {
        let runner = {
            let guard = self.override_runner.lock().expect("cli override lock");
            guard
                .as_ref()
                .map(Arc::clone)
                .unwrap_or_else(|| Arc::clone(&self.default_runner))
        };
        runner.invoke(req, kill).await
    }

    /// Store a health-poll result for later queries.
    pub fn record_health(&self, kind: CliKind, report: HealthReport) {
        self.health
            .lock()
            .expect("cli health lock")
            .insert(kind, report);
    }

    pub fn health_of(&self, kind: CliKind) -> Option<HealthReport> {
        self.health.lock().expect("cli health lock").get(&kind).cloned()
    }

    /// A kind is unavailable only when its latest report says so; a kind
    /// never probed counts as available.
    pub fn is_available(&self, kind: CliKind) -> bool {
        match self.health_of(kind) {
            Some(report) => report.state == HealthState::Healthy,
            None => true,
        }
    }

    /// First kind reported healthy, else the first never-probed kind.
    pub fn first_healthy(&self) -> Option<CliKind> {
        let health = self.health.lock().expect("cli health lock");
        CliKind::ALL
            .iter()
            .copied()
            .find(|k| {
                health
                    .get(k)
                    .map(|r| r.state == HealthState::Healthy)
                    .unwrap_or(false)
            })
            .or_else(|| {
                CliKind::ALL
                    .iter()
                    .copied()
                    .find(|k| !health.contains_key(k))
            })
    }
}
