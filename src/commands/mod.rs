pub mod check_config;
pub mod publish;
pub mod serve;

use anyhow::{Context, Result};
use std::path::Path;

use crawlgate::config::GatewayConfig;

// Re-export command functions for convenience
pub use check_config::check_config;
pub use publish::{publish, PublishParams};
pub use serve::serve;

/// Load configuration from an optional file, then apply `CRAWLGATE_*` overrides
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    let mut config = match path {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid CRAWLGATE_* environment override")?;
    Ok(config)
}
