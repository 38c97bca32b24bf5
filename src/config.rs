//! Configuration
//!
//! Layered configuration: built-in defaults, then `restbench.toml` (working
//! directory or an explicit path), then `RESTBENCH_*` environment variables
//! where `__` separates nested keys (`RESTBENCH_HTTP__TIMEOUT_MS=5000`).

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LoggingConfig;

pub const CONFIG_FILE: &str = "restbench.toml";
const ENV_PREFIX: &str = "RESTBENCH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_database_file")]
    pub database_file: String,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings applied to every outgoing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_ms")]
    pub case_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_session_file")]
    pub session_file: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".restbench")
}

fn default_database_file() -> String {
    "restbench.db".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> usize {
    10
}

fn default_user_agent() -> String {
    "API-Testing-Tool/1.0".to_string()
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_concurrency() -> usize {
    4
}

fn default_session_file() -> String {
    "session.json".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            verify_ssl: true,
            follow_redirects: true,
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
            retry_count: 0,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            case_timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
            http: HttpConfig::default(),
            runner: RunnerConfig::default(),
            remote: RemoteConfig {
                base_url: None,
                session_file: default_session_file(),
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration. An explicit `path` must exist; otherwise
    /// `restbench.toml` in the working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("data_dir", ".restbench")?
            .set_default("database_file", "restbench.db")?;

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "config file `{}` does not exist",
                        path.display()
                    )));
                }
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                builder = builder.add_source(File::from(Path::new(CONFIG_FILE)).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data_dir cannot be empty".into()));
        }
        if self.database_file.trim().is_empty() {
            return Err(Error::Config("database_file cannot be empty".into()));
        }
        if self.http.timeout_ms == 0 {
            return Err(Error::Config("http.timeout_ms must be greater than zero".into()));
        }
        if self.runner.concurrency == 0 {
            return Err(Error::Config("runner.concurrency must be at least 1".into()));
        }
        if self.runner.case_timeout_ms == 0 {
            return Err(Error::Config("runner.case_timeout_ms must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(&self.remote.session_file)
    }
}
