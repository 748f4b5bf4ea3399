//! Proxy health checker
//!
//! Fetches a known URL through every proxy in the pool on a fixed cadence.
//! A failed fetch counts against the proxy like a reported failure; a
//! successful one clears its failure count. The pool is re-read each round,
//! so proxies added at runtime are picked up.

use reqwest::{Client, Proxy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::{ProxyRecord, RotationError, RotationStore};
use crate::config::RotationConfig;
use crate::metrics;

/// Periodically checks every proxy and feeds the rotation store
pub struct ProxyHealthChecker {
    store: Arc<RotationStore>,
    check_url: String,
    timeout: Duration,
    check_interval: Duration,
}

impl ProxyHealthChecker {
    pub fn new(store: Arc<RotationStore>, config: &RotationConfig) -> Self {
        Self {
            store,
            check_url: config.health_check_url.clone(),
            timeout: config.health_check_timeout(),
            check_interval: config.health_check_interval(),
        }
    }

    /// Check one proxy once and record the result
    pub async fn check(&self, proxy_url: &str) -> Result<ProxyRecord, RotationError> {
        match fetch_through(proxy_url, &self.check_url, self.timeout).await {
            Ok(()) => self.store.record_proxy_healthy(proxy_url).await,
            Err(reason) => {
                tracing::debug!(proxy = proxy_url, error = %reason, "Proxy health check failed");
                self.store.record_proxy_failure(proxy_url).await
            }
        }
    }

    /// Check every proxy once, concurrently; returns how many passed
    pub async fn check_all(&self) -> usize {
        let urls = self.store.proxy_urls().await;
        let checks = urls.iter().map(|url| self.check(url));
        let healthy = futures::future::join_all(checks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(record) if record.failure_count == 0))
            .count();

        metrics::update_proxy_health(healthy);
        tracing::debug!(proxies = urls.len(), healthy, "Proxy health round complete");
        healthy
    }

    /// Spawn the check loop; `None` when `health_check_interval_ms` is 0
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.check_interval.is_zero() {
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = interval(self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_all().await;
                        if let Err(e) = self.store.flush().await {
                            tracing::warn!(error = %e, "Failed to save rotation state");
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("Proxy health loop shutting down");
                        break;
                    }
                }
            }
        }))
    }
}

/// GET `check_url` through `proxy_url`; any 2xx passes
async fn fetch_through(proxy_url: &str, check_url: &str, timeout: Duration) -> Result<(), String> {
    let proxy = Proxy::all(proxy_url).map_err(|e| e.to_string())?;
    let client = Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .get(check_url)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("status {}", response.status()))
    }
}
