use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Noisy transport crates kept at WARN unless `RUST_LOG` says otherwise.
const NOISY_CRATES: &[&str] = &["h2", "hyper", "tower", "tonic"];

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = std::iter::once(cfg.level.clone())
            .chain(NOISY_CRATES.iter().map(|krate| format!("{krate}=warn")))
            .collect::<Vec<_>>()
            .join(",");
        EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = match cfg.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}
