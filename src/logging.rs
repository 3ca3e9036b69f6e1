//! Tracing setup for embedding binaries
//!
//! The crate itself only emits `tracing` events; the embedding process calls
//! [`init`] once at startup to install a subscriber.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `PRESSLINE_LOG` overrides the configured level filter when set. Calling
/// this twice returns an error from the subscriber registry.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let directive = std::env::var("PRESSLINE_LOG")
        .unwrap_or_else(|_| format!("pressline={},info", config.level));
    let env_filter = tracing_subscriber::EnvFilter::new(directive);

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
    }

    Ok(())
}
