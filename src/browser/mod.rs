//! Remote browser sessions
//!
//! After a lease is granted the scheduler may open a session on the
//! WebDriver hub and hand its id to the backend, which then drives the
//! browser remotely. Sessions are deleted when the job finishes or when
//! dispatch fails.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::config::BrowserConfig;
use crate::error::{ClassifiedError, ErrorKind};
use crate::utils::retry::{with_retry_if, RetryConfig};

/// An open remote browser session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSession {
    pub session_id: String,
    /// Hub URL the backend should connect to
    pub executor_url: String,
}

impl BrowserSession {
    /// Settings that point a backend's browser middleware at this session
    pub fn settings(&self) -> [(String, String); 2] {
        [
            ("SELENIUM_COMMAND_EXECUTOR".to_string(), self.executor_url.clone()),
            ("SELENIUM_SESSION_ID".to_string(), self.session_id.clone()),
        ]
    }
}

/// Creates and destroys remote browser sessions
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn create(&self, job_id: &str) -> Result<BrowserSession, SessionError>;

    async fn destroy(&self, session_id: &str) -> Result<(), SessionError>;
}

/// W3C WebDriver hub client
pub struct WebDriverSessions {
    endpoint: String,
    browser_name: String,
    http_client: Client,
    retry: RetryConfig,
}

impl WebDriverSessions {
    pub fn new(endpoint: &str, config: &BrowserConfig, retry: RetryConfig) -> Result<Self, SessionError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.session_timeout_ms))
            .build()
            .map_err(|e| SessionError::Init(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            browser_name: config.browser_name.clone(),
            http_client,
            retry,
        })
    }

    /// Build a provider when an endpoint is configured
    pub fn from_config(config: &BrowserConfig, retry: &RetryConfig) -> Result<Option<Self>, SessionError> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config, retry.clone()))
            .transpose()
    }

    async fn create_once(&self) -> Result<BrowserSession, SessionError> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": { "browserName": self.browser_name }
            }
        });

        let response = self
            .http_client
            .post(format!("{}/session", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                SessionError::Unreachable(format!("HTTP {status}: {message}"))
            } else {
                SessionError::Rejected(format!("HTTP {status}: {message}"))
            });
        }

        let created: NewSessionResponse = response
            .json()
            .await
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;

        let session_id = created
            .value
            .session_id
            .or(created.session_id)
            .ok_or_else(|| SessionError::InvalidResponse("missing sessionId".to_string()))?;

        Ok(BrowserSession {
            session_id,
            executor_url: self.endpoint.clone(),
        })
    }
}

#[async_trait]
impl SessionProvider for WebDriverSessions {
    async fn create(&self, job_id: &str) -> Result<BrowserSession, SessionError> {
        let session = with_retry_if(&self.retry, || self.create_once(), SessionError::is_transient).await?;
        tracing::debug!(job_id, session_id = %session.session_id, "Browser session created");
        Ok(session)
    }

    async fn destroy(&self, session_id: &str) -> Result<(), SessionError> {
        let response = self
            .http_client
            .delete(format!("{}/session/{}", self.endpoint, session_id))
            .send()
            .await
            .map_err(|e| SessionError::Unreachable(e.to_string()))?;

        // A session the hub already forgot is as good as deleted
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(session_id, "Browser session closed");
            Ok(())
        } else {
            Err(SessionError::Rejected(format!("HTTP {}", response.status())))
        }
    }
}

#[derive(Debug, Deserialize)]
struct NewSessionResponse {
    #[serde(default)]
    value: NewSessionValue,
    /// Pre-W3C hubs put the id at the top level
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NewSessionValue {
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

/// Browser session errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("WebDriver hub unreachable: {0}")]
    Unreachable(String),

    #[error("WebDriver hub refused the session: {0}")]
    Rejected(String),

    #[error("Invalid WebDriver response: {0}")]
    InvalidResponse(String),

    #[error("Failed to initialise WebDriver client: {0}")]
    Init(String),
}

impl SessionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl ClassifiedError for SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(_) | Self::InvalidResponse(_) => ErrorKind::BackendUnreachable,
            Self::Rejected(_) => ErrorKind::ResourceUnavailable,
            Self::Init(_) => ErrorKind::Internal,
        }
    }
}
