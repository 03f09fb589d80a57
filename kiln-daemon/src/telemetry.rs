//! Tracing initialization for kilnd.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber. `RUST_LOG` overrides the configured
/// default level.
pub fn init(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;
    Ok(())
}
