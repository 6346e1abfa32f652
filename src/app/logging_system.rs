use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use super::config::LogLevel;

/// Dependencies whose debug output drowns the agent's own logs.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to set global tracing subscriber: {0}")]
    AlreadySet(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Filter with the configured level for the agent and `warn` for noisy
/// dependencies. `RUST_LOG`, when set, replaces it entirely.
pub fn build_filter_string(level: LogLevel) -> String {
    let mut parts = Vec::with_capacity(QUIET_TARGETS.len() + 1);
    parts.push(level.as_str().to_string());
    parts.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    parts.join(",")
}

fn env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| build_filter_string(level));

    EnvFilter::try_new(&filter).map_err(|source| LoggingError::InvalidFilter { filter, source })
}

pub fn setup_logging(level: LogLevel, json: bool) -> Result<(), LoggingError> {
    let filter = env_filter(level)?;
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        let subscriber = registry.with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(false),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = registry.with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .compact(),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
