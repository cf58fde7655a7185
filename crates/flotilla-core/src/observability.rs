use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogConfig, LogFormat};

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },

    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// `RUST_LOG` wins over `log.level`. Logs go to stderr.
pub fn filter_for(log: &LogConfig) -> Result<EnvFilter, TracingError> {
    match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => Ok(EnvFilter::from_default_env()),
        _ => EnvFilter::try_new(&log.level).map_err(|e| TracingError::Filter {
            directive: log.level.clone(),
            reason: e.to_string(),
        }),
    }
}

pub fn init_tracing(log: &LogConfig) -> Result<(), TracingError> {
    let filter = filter_for(log)?;

    let plain = (log.format == LogFormat::Plain)
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    let json = (log.format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| TracingError::AlreadyInstalled(e.to_string()))
}
