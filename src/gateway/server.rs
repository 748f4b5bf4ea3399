//! Gateway server
//!
//! Wires the components together, owns the background tasks (health probes,
//! lease sweep, job tracker, intake workers) and serves the HTTP API until
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admission::{build_ledger, AdmissionController};
use crate::backend::{build_clients, BackendClients};
use crate::browser::WebDriverSessions;
use crate::config::GatewayConfig;
use crate::intake::{IntakeService, RedisQueueBroker};
use crate::registry::{BackendRegistry, HealthProber};
use crate::rotation::{ProxyHealthChecker, RotationStore};
use crate::scheduler::{build_dispatch_log, JobTracker, Scheduler};

use super::api::create_router;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,

    /// Present when queue intake is enabled
    pub intake: Option<Arc<IntakeService>>,

    pub start_time: Instant,

    pub config: Arc<GatewayConfig>,
}

// ============================================================================
// Gateway Server
// ============================================================================

/// The crawlgate HTTP gateway
pub struct GatewayServer {
    config: GatewayConfig,
    clients: BackendClients,
    state: AppState,
}

impl GatewayServer {
    /// Build every component from configuration
    ///
    /// Connects to Redis when the ledger or intake uses it, so this fails
    /// fast on an unreachable broker.
    pub async fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;

        let clients = build_clients(&config).map_err(|e| ServerError::InitError(e.to_string()))?;
        let registry = Arc::new(BackendRegistry::new(
            &config.backends,
            config.probe.failure_threshold,
        ));
        let ledger = build_ledger(&config.ledger)
            .await
            .map_err(|e| ServerError::InitError(e.to_string()))?;
        let admission = Arc::new(AdmissionController::new(ledger, &config.admission));
        let rotation = Arc::new(
            RotationStore::open(&config.rotation)
                .await
                .map_err(|e| ServerError::InitError(e.to_string()))?,
        );

        let dispatch_log = build_dispatch_log(&config.ledger)
            .await
            .map_err(|e| ServerError::InitError(e.to_string()))?;
        // A process-local log forgets dispatches on restart; fall back to backend listings
        let remote_check = !dispatch_log.is_durable();

        let mut scheduler = Scheduler::new(
            registry,
            clients.clone(),
            admission,
            rotation,
            &config.admission,
        )
        .with_dispatch_log(dispatch_log, &config.ledger)
        .with_remote_check(remote_check);
        if let Some(sessions) = WebDriverSessions::from_config(&config.browser, &config.retry)
            .map_err(|e| ServerError::InitError(e.to_string()))?
        {
            scheduler = scheduler.with_sessions(Arc::new(sessions));
        }
        let scheduler = Arc::new(scheduler);

        let intake = if config.intake.enabled {
            let broker = RedisQueueBroker::connect(config.intake_redis_url(), &config.intake)
                .await
                .map_err(|e| ServerError::InitError(e.to_string()))?;
            Some(Arc::new(IntakeService::new(
                Arc::new(broker),
                Arc::clone(&scheduler),
                &config.intake,
            )))
        } else {
            None
        };

        Ok(Self::from_parts(config, clients, scheduler, intake))
    }

    /// Assemble a server from prebuilt components
    pub fn from_parts(
        config: GatewayConfig,
        clients: BackendClients,
        scheduler: Arc<Scheduler>,
        intake: Option<Arc<IntakeService>>,
    ) -> Self {
        let state = AppState {
            scheduler,
            intake,
            start_time: Instant::now(),
            config: Arc::new(config.clone()),
        };
        Self {
            config,
            clients,
            state,
        }
    }

    /// Get the application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.server.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.server.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves, then stop background tasks
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self.config.server.bind_address;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = self.start_background_tasks(shutdown_rx).await?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;
        tracing::info!(%addr, "crawlgate listening");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()));

        shutdown_tx.send(true).ok();
        futures::future::join_all(handles).await;
        tracing::info!("crawlgate shutdown complete");
        served
    }

    /// Probe every backend once, then start the periodic tasks
    async fn start_background_tasks(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, ServerError> {
        let scheduler = &self.state.scheduler;
        let mut handles = Vec::new();

        let prober = HealthProber::new(
            Arc::clone(scheduler.registry()),
            self.clients.clone(),
            self.config.probe.probe_interval(),
        );
        prober.probe_all().await;
        handles.extend(prober.spawn(shutdown.clone()));

        handles.push(Arc::clone(scheduler.admission()).spawn_sweeper(shutdown.clone()));

        let rotation = scheduler.rotation();
        if let Some(flusher) = Arc::clone(rotation).spawn_flusher(shutdown.clone()) {
            handles.push(flusher);
        }
        if self.config.rotation.proxy_rotation_enabled {
            let checker = ProxyHealthChecker::new(Arc::clone(rotation), &self.config.rotation);
            handles.extend(checker.spawn(shutdown.clone()));
        }

        let tracker = JobTracker::new(Arc::clone(scheduler), self.config.probe.job_poll_interval());
        handles.push(tracker.spawn(shutdown.clone()));

        if let Some(intake) = &self.state.intake {
            let workers = Arc::clone(intake)
                .start(shutdown)
                .await
                .map_err(|e| ServerError::InitError(e.to_string()))?;
            handles.extend(workers);
        }

        tracing::info!(tasks = handles.len(), "Background tasks started");
        Ok(handles)
    }

    /// Get server info
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bind_address: self.config.server.bind_address,
            backends: self.config.backends.len(),
            max_concurrent_sessions: self.config.admission.max_concurrent_sessions,
            ledger: self.state.scheduler.admission().ledger_name(),
            intake_enabled: self.state.intake.is_some(),
            cors_enabled: self.config.server.enable_cors,
        }
    }
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub backends: usize,
    pub max_concurrent_sessions: u32,
    pub ledger: &'static str,
    pub intake_enabled: bool,
    pub cors_enabled: bool,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "crawlgate\n\
             {:-<40}\n\
             Bind Address: {}\n\
             Backends: {}\n\
             Max Browser Sessions: {}\n\
             Ledger: {}\n\
             Queue Intake: {}\n\
             CORS: {}",
            "",
            self.bind_address,
            self.backends,
            self.max_concurrent_sessions,
            self.ledger,
            if self.intake_enabled { "enabled" } else { "disabled" },
            if self.cors_enabled { "enabled" } else { "disabled" }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Configuration error
    ConfigError(String),

    /// Component initialization error
    InitError(String),

    /// Failed to bind to address
    BindError(String),

    /// Server error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Self::InitError(msg) => write!(f, "Initialization error: {}", msg),
            Self::BindError(msg) => write!(f, "Failed to bind: {}", msg),
            Self::ServeError(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn config() -> GatewayConfig {
        GatewayConfig::builder()
            .backend(BackendConfig::new("node-1", "http://127.0.0.1:6800"))
            .max_concurrent_sessions(2)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_creation_with_memory_ledger() {
        let server = GatewayServer::new(config()).await.unwrap();
        let info = server.info();

        assert_eq!(info.backends, 1);
        assert_eq!(info.ledger, "memory");
        assert!(!info.intake_enabled);
        assert!(info.display().contains("Max Browser Sessions: 2"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = GatewayServer::new(GatewayConfig::default()).await.err().unwrap();
        assert!(matches!(err, ServerError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_app_state_components() {
        let server = GatewayServer::new(config()).await.unwrap();
        let state = server.state();

        let nodes = state.scheduler.registry().snapshot().await;
        assert_eq!(nodes.len(), 1);
        assert!(state.scheduler.jobs().is_empty().await);
    }
}
