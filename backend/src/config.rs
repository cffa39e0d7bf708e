//! Service configuration.
//!
//! Loaded from a TOML file (`PAYROLL_CONFIG`, default `payroll.toml`). Every key
//! has a default, so a missing file yields a working local setup. A few keys can
//! be overridden from the environment: `WEBHOOK_URL`, `PAYROLL_DB`, `PAYROLL_PORT`.

use crate::delivery::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};
use thiserror::Error;

pub const CONFIG_ENV: &str = "PAYROLL_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "payroll.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub render: RenderConfig,
    pub delivery: DeliveryConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("payroll.sqlite"),
        }
    }
}

/// Size of the shared worker pool. Bounds concurrent renderer processes and
/// concurrent webhook calls across all sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    /// Finished runs kept in memory with their full event history. Older runs
    /// are served from the store.
    pub retained_runs: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retained_runs: 16,
        }
    }
}

/// External document renderer.
///
/// Arguments may contain `{input}`, `{outdir}`, `{output}` and `{stem}`; they
/// are replaced with paths inside a per-render temp directory (`{stem}` is
/// `{output}` without its extension). The converter turns the filled template
/// into `slip.pdf`, or straight into `slip.png` when no rasterizer is set. The
/// rasterizer turns `slip.pdf` into `slip.png`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub template_path: PathBuf,
    pub converter_program: String,
    pub converter_args: Vec<String>,
    pub rasterizer_program: Option<String>,
    pub rasterizer_args: Vec<String>,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl RenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from("templates/salary_slip.fods"),
            converter_program: "soffice".to_string(),
            converter_args: Vec::from(
                ["--headless", "--convert-to", "pdf", "--outdir", "{outdir}", "{input}"]
                    .map(String::from),
            ),
            rasterizer_program: Some("pdftoppm".to_string()),
            rasterizer_args: Vec::from(
                ["-png", "-r", "150", "-singlefile", "{input}", "{stem}"].map(String::from),
            ),
            timeout_ms: 60_000,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1_000,
                factor: 2.0,
                max_delay_ms: 10_000,
                jitter: 0.2,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub webhook_url: Option<String>,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Caption sent along with every slip.
    pub message_content: String,
    /// Pause after each send, with the worker slot held, to pace the webhook.
    pub send_delay_ms: u64,
    pub retry: RetryPolicy,
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            message_content: String::new(),
            send_delay_ms: 0,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Events buffered per subscriber before it is disconnected.
    pub subscriber_buffer: usize,
    pub heartbeat_secs: u64,
}

impl BroadcastConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
            heartbeat_secs: 15,
        }
    }
}

impl AppConfig {
    /// Loads the file named by `PAYROLL_CONFIG`, applies env overrides and validates.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file. A file that does not exist yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("WEBHOOK_URL").filter(|u| !u.trim().is_empty()) {
            self.delivery.webhook_url = Some(url);
        }
        if let Some(path) = lookup("PAYROLL_DB") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(port) = lookup("PAYROLL_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1".into()));
        }
        if self.broadcast.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.subscriber_buffer must be at least 1".into(),
            ));
        }
        if self.broadcast.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.heartbeat_secs must be at least 1".into(),
            ));
        }
        if self.render.timeout_ms == 0 {
            return Err(ConfigError::Invalid("render.timeout_ms must be positive".into()));
        }
        self.render
            .retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("render.retry: {}", e)))?;
        self.delivery
            .retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("delivery.retry: {}", e)))?;
        Ok(())
    }
}
