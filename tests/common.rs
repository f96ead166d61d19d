#![allow(dead_code)]

//! Shared fixtures: temp store, seeded entities, scripted stub CLI.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use malamar::events::{EventBus, RunnerEvent};
use malamar::model::{Agent, CliKind, Task, Workspace};
use malamar::runner::cli::{
    BoxFuture, CliAdapter, CliError, CliRunner, InvokeOutcome, InvokeRequest,
};
use malamar::runner::processes::{KillSignal, ProcessRegistry};
use malamar::runner::RunnerContext;
use malamar::store::Store;

/// One scripted CLI response, consumed in invocation order.
pub enum Script {
    /// Write this JSON to the requested output path, exit 0.
    Output(serde_json::Value),
    /// Exit non-zero with stderr, writing nothing.
    Fail { exit_code: i32, stderr: String },
    /// Exit 0 without creating the output file.
    NoOutput,
    /// Write raw (possibly invalid) content, exit 0.
    Raw(String),
    /// Block until killed through the process registry.
    Hang,
}

/// Scripted stand-in for the external CLIs, installed through the adapter's
/// override slot. Running out of script is a loud failure (exit 86).
pub struct StubCli {
    scripts: Mutex<VecDeque<Script>>,
    invocations: Mutex<Vec<InvokeRequest>>,
}

impl StubCli {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn invocations(&self) -> Vec<InvokeRequest> {
        self.invocations.lock().unwrap().clone()
    }
}

impl CliRunner for StubCli {
    fn invoke<'a>(
        &'a self,
        req: &'a InvokeRequest,
        kill: KillSignal,
    ) -> BoxFuture<'a, Result<InvokeOutcome, CliError>> {
        Box::pin(async move {
            self.invocations.lock().unwrap().push(req.clone());
            let script = self.scripts.lock().unwrap().pop_front();
            let ok = InvokeOutcome {
                success: true,
                exit_code: Some(0),
                stderr: String::new(),
            };
            match script {
                Some(Script::Output(value)) => {
                    std::fs::write(&req.output_path, value.to_string()).unwrap();
                    Ok(ok)
                }
                Some(Script::Raw(content)) => {
                    std::fs::write(&req.output_path, content).unwrap();
                    Ok(ok)
                }
                Some(Script::NoOutput) => Ok(ok),
                Some(Script::Fail { exit_code, stderr }) => Ok(InvokeOutcome {
                    success: false,
                    exit_code: Some(exit_code),
                    stderr,
                }),
                Some(Script::Hang) => {
                    let _ = kill.await;
                    Ok(InvokeOutcome {
                        success: false,
                        exit_code: None,
                        stderr: "killed".to_string(),
                    })
                }
                None => Ok(InvokeOutcome {
                    success: false,
                    exit_code: Some(86),
                    stderr: "stub script exhausted".to_string(),
                }),
            }
        })
    }
}

/// A runner context over a fresh temp store with the stub CLI installed.
pub struct TestHarness {
    pub tmp: TempDir,
    pub ctx: RunnerContext,
    pub stub: Arc<StubCli>,
}

pub fn harness(scripts: Vec<Script>) -> TestHarness {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&tmp.path().join("data")).unwrap());
    let cli = Arc::new(CliAdapter::new());
    let stub = StubCli::new(scripts);
    cli.set_override(Some(Arc::clone(&stub) as Arc<dyn CliRunner>));

    let ctx = RunnerContext {
        store,
        bus: Arc::new(EventBus::new()),
        processes: Arc::new(ProcessRegistry::new()),
        cli,
        temp_dir: tmp.path().join("tmp"),
        mailgun_configured: false,
    };
    TestHarness { tmp, ctx, stub }
}

impl TestHarness {
    pub fn store(&self) -> &Store {
        &self.ctx.store
    }

    pub fn workspace(&self, title: &str) -> Workspace {
        self.store().create_workspace(title, None).unwrap()
    }

    pub fn agent(&self, ws: &Workspace, name: &str) -> Agent {
        self.store()
            .create_agent(
                &ws.id,
                name,
                &format!("You are {name}."),
                Some(CliKind::Claude),
                None,
            )
            .unwrap()
    }

    pub fn task(&self, ws: &Workspace, summary: &str) -> Task {
        self.store().create_task(&ws.id, summary, "").unwrap()
    }

    /// Record every bus event for later assertions.
    pub fn record_events(&self) -> Arc<Mutex<Vec<RunnerEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        self.ctx.bus.subscribe(move |e: &RunnerEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        events
    }
}

/// Event type names, in emission order.
pub fn event_types(events: &Arc<Mutex<Vec<RunnerEvent>>>) -> Vec<&'static str> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.event_type())
        .collect()
}
