//! Malamar: local orchestration service for agentic CLI tools.
//!
//! Single binary: opens the store, starts the runner, serves until ctrl-c.
//! Config: `~/.malamar/config.toml`, or a path given as the first argument.

use std::path::PathBuf;
use std::sync::Arc;

use malamar::config::Config;
use malamar::events::EventBus;
use malamar::runner::cli::CliAdapter;
use malamar::runner::processes::ProcessRegistry;
use malamar::runner::{Runner, RunnerContext};
use malamar::sse::SseRegistry;
use malamar::store::Store;

fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".malamar").join("config.toml"),
        None => PathBuf::from(".malamar").join("config.toml"),
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level()));
    if config.log_format() == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = Config::load(&config_path)?;
    init_tracing(&config);

    let store = Arc::new(Store::open(&config.data_dir())?);
    let bus = Arc::new(EventBus::new());
    let sse = Arc::new(SseRegistry::new());
    sse.init(&bus);

    let runner = Runner::new(
        RunnerContext {
            store,
            bus: Arc::clone(&bus),
            processes: Arc::new(ProcessRegistry::new()),
            cli: Arc::new(CliAdapter::new()),
            temp_dir: config.temp_dir(),
            mailgun_configured: config.mailgun_configured(),
        },
        config.runner_poll_interval(),
    );
    runner.start().await?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir().display(),
        "malamar running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    runner.stop().await;
    sse.shutdown(&bus);
    Ok(())
}
