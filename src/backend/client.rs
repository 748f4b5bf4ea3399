//! HTTP client for Scrapyd-compatible worker backends

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{BackendClient, BackendError, DaemonStatus, JobListing};
use crate::config::BackendConfig;
use crate::models::JobSpec;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Form keys the backend interprets itself; spider arguments may not shadow them
const RESERVED_FORM_KEYS: &[&str] = &["project", "spider", "jobid", "_version", "setting"];

// ============================================================================
// Client
// ============================================================================

/// Scrapyd protocol client for one node
#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    node_id: String,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    http_client: Client,
    retry: RetryConfig,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpBackendClient {
    /// Create a client for a configured backend
    pub fn new(backend: &BackendConfig, retry: RetryConfig) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("crawlgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Init(e.to_string()))?;

        Ok(Self {
            node_id: backend.id.clone(),
            base_url: backend.url.trim_end_matches('/').to_string(),
            username: backend.username.clone(),
            password: backend.password.clone(),
            http_client,
            retry,
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        })
    }

    /// Set the status probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the timeout for submit/cancel/list calls
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    // Internal: one request, unwrapping the `{"status": "ok" | "error"}` envelope
    async fn send_once<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, BackendError> {
        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(&self.node_id, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Http {
                node: self.node_id.clone(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::from_reqwest(&self.node_id, e))?;

        let envelope: Envelope = serde_json::from_value(body.clone()).map_err(|e| {
            BackendError::InvalidResponse {
                node: self.node_id.clone(),
                message: e.to_string(),
            }
        })?;

        if envelope.status != "ok" {
            return Err(BackendError::Rejected {
                node: self.node_id.clone(),
                message: envelope
                    .message
                    .unwrap_or_else(|| format!("status '{}'", envelope.status)),
            });
        }

        serde_json::from_value(body).map_err(|e| BackendError::InvalidResponse {
            node: self.node_id.clone(),
            message: e.to_string(),
        })
    }

    // Internal: request with retry on transient failures
    async fn send_with_retry<T, F>(&self, build: F) -> Result<T, BackendError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        with_retry_if(
            &self.retry,
            || self.send_once(build()),
            BackendError::is_transient,
        )
        .await
    }
}

/// Encode a job spec as the `schedule.json` form body
///
/// Settings go out as repeated `setting=KEY=VALUE` pairs; arguments as plain
/// fields. Pairs are sorted so the body is deterministic.
pub fn schedule_form(spec: &JobSpec) -> Vec<(String, String)> {
    let mut form = vec![
        ("project".to_string(), spec.project.clone()),
        ("spider".to_string(), spec.spider.clone()),
        ("jobid".to_string(), spec.job_id.clone()),
    ];
    if let Some(version) = &spec.version {
        form.push(("_version".to_string(), version.clone()));
    }

    let mut settings: Vec<_> = spec.settings.iter().collect();
    settings.sort();
    for (key, value) in settings {
        form.push(("setting".to_string(), format!("{key}={value}")));
    }

    let mut args: Vec<_> = spec
        .args
        .iter()
        .filter(|(k, _)| !RESERVED_FORM_KEYS.contains(&k.as_str()))
        .collect();
    args.sort();
    for (key, value) in args {
        form.push((key.clone(), value.clone()));
    }
    form
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn status(&self) -> Result<DaemonStatus, BackendError> {
        let request = self.authed(
            self.http_client
                .get(self.url("daemonstatus.json"))
                .timeout(self.probe_timeout),
        );
        self.send_once(request).await
    }

    async fn submit(&self, spec: &JobSpec) -> Result<String, BackendError> {
        let form = schedule_form(spec);
        debug!(node = %self.node_id, job_id = %spec.job_id, spider = %spec.spider, "Submitting job");

        let response: ScheduleResponse = self
            .send_with_retry(|| {
                self.authed(
                    self.http_client
                        .post(self.url("schedule.json"))
                        .timeout(self.request_timeout)
                        .form(&form),
                )
            })
            .await?;

        Ok(response.jobid.unwrap_or_else(|| spec.job_id.clone()))
    }

    async fn cancel(&self, project: &str, job_id: &str) -> Result<Option<String>, BackendError> {
        let form = [("project", project), ("job", job_id)];

        let response: CancelResponse = self
            .send_with_retry(|| {
                self.authed(
                    self.http_client
                        .post(self.url("cancel.json"))
                        .timeout(self.request_timeout)
                        .form(&form),
                )
            })
            .await?;

        Ok(response.prevstate)
    }

    async fn list_jobs(&self, project: &str) -> Result<JobListing, BackendError> {
        self.send_with_retry(|| {
            self.authed(
                self.http_client
                    .get(self.url("listjobs.json"))
                    .timeout(self.request_timeout)
                    .query(&[("project", project)]),
            )
        })
        .await
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    #[serde(default)]
    jobid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    #[serde(default)]
    prevstate: Option<String>,
}
