use clap::{CommandFactory, FromArgMatches, Parser, ValueEnum, parser::ValueSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::buffer::BatchConfig;
use crate::jobs::OrchestratorConfig;
use crate::reliability::RetryPolicy;
use crate::sender::{ClientConfig, SigningCredential};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Argument error: {0}")]
    ArgError(#[from] clap::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about = "Collects directory data and streams it to a graph ingestion service", long_about = None)]
#[serde(default)]
pub struct Config {
    /// Base URL of the graph service instance
    #[arg(long, env = "BHE_URL", default_value = "")]
    pub instance: String,

    /// Client token id
    #[arg(long, env = "BHE_TOKEN_ID", default_value = "")]
    pub token_id: String,

    /// Client token secret
    #[arg(long, env = "BHE_TOKEN", default_value = "", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub token: String,

    /// Proxy URL for all outbound traffic
    #[arg(long, env = "PROXY")]
    pub proxy: Option<String>,

    /// Requests served by one connection pool before it is replaced
    #[arg(long, env = "BHE_MAX_REQ_PER_CONN", default_value = "1000")]
    pub max_requests_per_connection: u64,

    /// Retries after the first attempt for transient failures
    #[arg(long, env = "BHE_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Backoff base in seconds; attempt n waits base^(n+1) seconds
    #[arg(long, env = "BHE_RETRY_DELAY_SECS", default_value = "5")]
    pub retry_delay_secs: u32,

    /// Upper bound for a single backoff pause in seconds
    #[arg(long, env = "BHE_MAX_RETRY_DELAY_SECS", default_value = "300")]
    pub max_retry_delay_secs: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "BHE_REQUEST_TIMEOUT_SECS", default_value = "120")]
    pub request_timeout_secs: u64,

    /// Records per ingest batch
    #[arg(long, env = "COL_BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// Idle time in seconds before a partial batch is sent
    #[arg(long, env = "COL_BATCH_TIMEOUT_SECS", default_value = "10")]
    pub batch_timeout_secs: u64,

    /// Seconds between job polls and heartbeats
    #[arg(long, env = "JOB_POLL_INTERVAL_SECS", default_value = "5")]
    pub poll_interval_secs: u64,

    /// Seconds to wait for an active job on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "30")]
    pub shutdown_grace_secs: u64,

    /// JSON-lines file or directory the collector reads records from
    #[arg(long, env = "COLLECT_SOURCE")]
    pub source: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Configuration file path (optional)
    #[arg(long, env = "CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: String::new(),
            token_id: String::new(),
            token: String::new(),
            proxy: None,
            max_requests_per_connection: 1000,
            max_retries: 3,
            retry_delay_secs: 5,
            max_retry_delay_secs: 300,
            request_timeout_secs: 120,
            batch_size: 100,
            batch_timeout_secs: 10,
            poll_interval_secs: 5,
            shutdown_grace_secs: 30,
            source: None,
            log_level: LogLevel::Info,
            log_json: false,
            config_file: None,
        }
    }
}

impl Config {
    /// Parses CLI arguments and environment, layering them over the config
    /// file when one is given. Explicit arguments and variables win.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Config::command().try_get_matches_from(args)?;
        let cli = Config::from_arg_matches(&matches)?;

        let mut config = match &cli.config_file {
            Some(path) => {
                let mut file = Self::read_file(path)?;
                file.merge_explicit(cli, |id| {
                    matches!(
                        matches.value_source(id),
                        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
                    )
                });
                file
            }
            None => cli,
        };

        config.post_process();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path.as_ref())?;
        config.config_file = Some(path.as_ref().to_path_buf());
        config.post_process();
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn merge_explicit(&mut self, cli: Config, explicit: impl Fn(&str) -> bool) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if explicit(stringify!($field)) {
                    self.$field = cli.$field;
                })*
            };
        }
        take!(
            instance,
            token_id,
            token,
            proxy,
            max_requests_per_connection,
            max_retries,
            retry_delay_secs,
            max_retry_delay_secs,
            request_timeout_secs,
            batch_size,
            batch_timeout_secs,
            poll_interval_secs,
            shutdown_grace_secs,
            source,
            log_level,
            log_json,
        );
        self.config_file = cli.config_file;
    }

    pub fn post_process(&mut self) {
        self.instance = self.instance.trim().to_string();
        if self.proxy.as_deref().is_some_and(|p| p.trim().is_empty()) {
            self.proxy = None;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let instance = Url::parse(&self.instance).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid instance URL '{}': {}", self.instance, e))
        })?;
        if !matches!(instance.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "Instance URL must use http or https: {}",
                self.instance
            )));
        }

        if let Some(proxy) = &self.proxy {
            Url::parse(proxy).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid proxy URL '{proxy}': {e}"))
            })?;
        }

        if self.token_id.trim().is_empty() || self.token.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Token id and token are required".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.max_requests_per_connection == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max requests per connection must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 || self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request timeout and poll interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay_secs)
            .with_max_delay(Duration::from_secs(self.max_retry_delay_secs))
    }

    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let instance = Url::parse(&self.instance)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.instance)))?;
        let proxy = self
            .proxy
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| ConfigError::InvalidUrl(format!("proxy: {e}")))?;

        let mut client = ClientConfig::new(
            instance,
            SigningCredential::new(self.token_id.clone(), self.token.clone()),
        );
        client.proxy = proxy;
        client.max_requests_per_connection = self.max_requests_per_connection;
        client.retry = self.retry_policy();
        client.request_timeout = Duration::from_secs(self.request_timeout_secs);
        Ok(client)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            batch: BatchConfig {
                max_size: self.batch_size,
                flush_timeout: Duration::from_secs(self.batch_timeout_secs),
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}
