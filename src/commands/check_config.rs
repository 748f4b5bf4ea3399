use anyhow::{Context, Result};

use crawlgate::config::GatewayConfig;

/// Validate configuration and print the effective values
pub fn check_config(config: GatewayConfig) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    println!("Configuration OK");
    println!("  Bind address: {}", config.server.bind_address);
    println!("  Backends: {}", config.backends.len());
    for backend in &config.backends {
        let auth = if backend.username.is_some() { " (basic auth)" } else { "" };
        println!("    {} -> {}{}", backend.id, backend.url, auth);
    }
    println!(
        "  Browser sessions: max {} (lease ttl {} ms)",
        config.admission.max_concurrent_sessions, config.admission.lease_ttl_ms
    );
    println!("  Ledger: {:?}", config.ledger.backend);
    println!(
        "  Intake: {}",
        if config.intake.enabled {
            format!("enabled ({} workers on '{}')", config.intake.workers, config.intake.queue_name)
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  Browser endpoint: {}",
        config.browser.endpoint.as_deref().unwrap_or("none")
    );
    Ok(())
}
