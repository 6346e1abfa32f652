pub mod config;
pub mod logging_system;
pub mod shutdown;

pub use config::{Config, ConfigError, LogLevel};
pub use logging_system::{LoggingError, setup_logging};
pub use shutdown::spawn_signal_listener;

use std::process;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::collector::JsonLinesCollector;
use crate::jobs::{JobOrchestrator, OrchestratorError};
use crate::sender::{ClientError, DeliveryClient};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error("failed to create signing HTTP client: {0}")]
    Client(#[from] ClientError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

pub struct App {
    config: Config,
    orchestrator: JobOrchestrator,
}

impl App {
    pub fn from_args<I, T>(args: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args(args)?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self, AppError> {
        let source = config.source.clone().ok_or_else(|| {
            ConfigError::InvalidConfig(
                "A collection source is required (--source or COLLECT_SOURCE)".to_string(),
            )
        })?;

        let client = DeliveryClient::new(config.client_config()?)?;
        let collector = JsonLinesCollector::new(source);
        let orchestrator = JobOrchestrator::new(
            Arc::new(client),
            Arc::new(collector),
            config.orchestrator_config(),
        );

        Ok(Self {
            config,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(self) -> Result<(), AppError> {
        let shutdown = CancellationToken::new();
        let listener = spawn_signal_listener(shutdown.clone());

        info!(
            instance = %self.config.instance,
            batch_size = self.config.batch_size,
            max_requests_per_connection = self.config.max_requests_per_connection,
            "Starting azure-graph-forwarder v{}",
            crate::VERSION
        );

        let result = self.orchestrator.run(shutdown).await;
        listener.abort();
        result?;

        info!("azure-graph-forwarder stopped");
        Ok(())
    }
}

// Main entry point for the application
pub async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match Config::from_args(std::env::args_os()) {
        Ok(config) => config,
        Err(ConfigError::ArgError(e)) => e.exit(),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            process::exit(1);
        }
    };

    setup_logging(config.log_level, config.log_json)?;

    let app = match App::from_config(config) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Initialization failed");
            process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!(error = %e, "Application error");
        process::exit(1);
    }

    Ok(())
}
