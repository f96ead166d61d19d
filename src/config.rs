//! Config load, defaults, validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3999;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_FORMAT: &str = "pretty";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("config parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Root config: HTTP bind address (consumed by the HTTP layer), data/temp
/// directories, logging, runner poll interval, optional mailgun credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<String>,
    pub temp_dir: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    /// Runner poll interval in milliseconds.
    pub runner_poll_interval: Option<u64>,
    pub mailgun: Option<MailgunConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MailgunConfig {
    pub api_key: Option<String>,
    pub domain: Option<String>,
}

impl Config {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Data directory holding `malamar.db`. Defaults to `~/.malamar`,
    /// falling back to the current directory when HOME is unset.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(ref d) = self.data_dir {
            return PathBuf::from(d);
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".malamar"),
            None => PathBuf::from(".malamar"),
        }
    }

    /// Scratch directory for CLI input/output/context files.
    pub fn temp_dir(&self) -> PathBuf {
        match self.temp_dir {
            Some(ref d) => PathBuf::from(d),
            None => std::env::temp_dir().join("malamar"),
        }
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// `pretty` or `json`; anything else falls back to `pretty`.
    pub fn log_format(&self) -> &str {
        match self.log_format.as_deref() {
            Some("json") => "json",
            _ => DEFAULT_LOG_FORMAT,
        }
    }

    pub fn runner_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.runner_poll_interval
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        )
    }

    /// True when a mailgun api key and domain are both present; feeds the
    /// "notifications configured" note in the workspace context doc.
    pub fn mailgun_configured(&self) -> bool {
        self.mailgun
            .as_ref()
            .map(|m| {
                m.api_key.as_deref().is_some_and(|k| !k.is_empty())
                    && m.domain.as_deref().is_some_and(|d| !d.is_empty())
            })
            .unwrap_or(false)
    }
}
