use anyhow::{Context, Result};

use crawlgate::config::GatewayConfig;
use crawlgate::gateway::GatewayServer;
use crawlgate::metrics;

/// Run the gateway until Ctrl+C
pub async fn serve(config: GatewayConfig) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without metrics");
    }

    let server = GatewayServer::new(config)
        .await
        .context("Failed to start gateway")?;

    println!("{}", server.info().display());
    println!();
    println!("API Endpoints:");
    println!("  GET  /                               - Service info");
    println!("  GET  /status                         - Backends and admission state");
    println!("  POST /schedule                       - Schedule a job");
    println!("  GET  /list-jobs/{{project}}            - Jobs across backends");
    println!("  POST /cancel/{{project}}/{{job_id}}      - Cancel a job");
    println!("  GET  /jobs/{{job_id}}                  - Local job view");
    println!("  POST /admin/reset-admission-counter  - Clear all leases (admin)");
    println!("  GET  /rotation                       - Proxy and identity catalog");
    println!("  GET  /health/live, /health/ready     - Health checks");
    println!("  GET  /metrics                        - Prometheus metrics");
    println!();
    println!("Press Ctrl+C to stop.\n");

    server
        .start_with_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                }
                Err(e) => {
                    tracing::error!("Failed to wait for Ctrl+C: {}", e);
                }
            }
        })
        .await?;

    Ok(())
}
