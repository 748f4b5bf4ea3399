// Core data structures for the crawlgate scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of a job
///
/// Transitions only move forward through `Pending -> Admitted -> Dispatched
/// -> Running -> Finished`. `Failed` and `Cancelled` are terminal and may be
/// entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Admitted,
    Dispatched,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobState {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Admitted => "admitted",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Job has not reached a backend yet
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Pending | Self::Admitted)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Admitted => 1,
            Self::Dispatched => 2,
            Self::Running => 3,
            Self::Finished | Self::Failed | Self::Cancelled => 4,
        }
    }

    /// Check whether moving to `next` keeps the lifecycle monotonic
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept strings, numbers and booleans as map values.
///
/// Callers historically sent loosely typed settings (`{"DOWNLOAD_DELAY": 2}`);
/// the scheduler only ever forwards them as strings.
pub(crate) fn deserialize_string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect())
}

/// A request to run a job, as received by the gateway API or the intake queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Caller-supplied job id (idempotency key); generated when absent
    #[serde(default, alias = "jobid", alias = "task_id")]
    pub job_id: Option<String>,

    pub project: String,

    pub spider: String,

    #[serde(default, alias = "_version")]
    pub version: Option<String>,

    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub settings: HashMap<String, String>,

    #[serde(default, alias = "kwargs", deserialize_with = "deserialize_string_map")]
    pub args: HashMap<String, String>,

    /// Pinned egress proxy (overrides rotation)
    #[serde(default)]
    pub proxy: Option<String>,

    /// Pinned client identity string (overrides rotation)
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Device class facet for identity selection (desktop, mobile, tablet)
    #[serde(default, alias = "device_class")]
    pub user_agent_type: Option<String>,

    /// Browser family facet for identity selection (chrome, firefox, ...)
    #[serde(default)]
    pub browser_family: Option<String>,

    /// Explicitly request (or opt out of) a browser-automation session
    #[serde(default)]
    pub browser: Option<bool>,

    /// Informational only; intake order stays FIFO
    #[serde(default)]
    pub priority: i32,
}

impl JobRequest {
    /// Create a minimal request
    pub fn new(project: impl Into<String>, spider: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            spider: spider.into(),
            ..Default::default()
        }
    }

    /// Set the job id
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Set a setting override
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Set a spider argument
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Request a browser session
    pub fn with_browser(mut self, browser: bool) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Validate required fields
    pub fn validate(&self) -> Result<(), String> {
        if self.project.trim().is_empty() {
            return Err("project must not be empty".to_string());
        }
        if self.spider.trim().is_empty() {
            return Err("spider must not be empty".to_string());
        }
        if let Some(id) = &self.job_id {
            if id.is_empty() || id.len() > 128 {
                return Err("job id must be 1-128 characters".to_string());
            }
            if id.chars().any(|c| c.is_whitespace() || c == '/') {
                return Err(format!("job id '{id}' contains whitespace or '/'"));
            }
        }
        Ok(())
    }
}

/// A job tracked by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub project: String,
    pub spider: String,
    pub version: Option<String>,
    pub settings: HashMap<String, String>,
    pub args: HashMap<String, String>,
    pub priority: i32,

    /// Whether the job holds (or waits for) a browser-session lease
    pub requires_browser: bool,

    pub assigned_backend: Option<String>,
    pub proxy: Option<String>,
    pub identity: Option<String>,
    pub lease_id: Option<String>,
    pub session_id: Option<String>,

    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Create a pending job from a request
    pub fn from_request(job_id: String, request: &JobRequest, requires_browser: bool) -> Self {
        Self {
            job_id,
            project: request.project.clone(),
            spider: request.spider.clone(),
            version: request.version.clone(),
            settings: request.settings.clone(),
            args: request.args.clone(),
            priority: request.priority,
            requires_browser,
            assigned_backend: None,
            proxy: None,
            identity: None,
            lease_id: None,
            session_id: None,
            state: JobState::Pending,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// Apply a lifecycle transition, rejecting non-monotonic moves
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        match next {
            JobState::Dispatched => self.dispatched_at = Some(Utc::now()),
            JobState::Finished | JobState::Failed | JobState::Cancelled => {
                self.finished_at = Some(Utc::now())
            }
            _ => {}
        }
        true
    }

    /// Whether a redelivery of this job id must be ignored
    pub fn blocks_resubmission(&self) -> bool {
        !self.state.is_terminal() || self.dispatched_at.is_some()
    }
}

/// Job specification sent to a worker backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub project: String,
    pub spider: String,
    pub job_id: String,
    pub version: Option<String>,
    pub settings: HashMap<String, String>,
    pub args: HashMap<String, String>,
}

impl JobSpec {
    /// Build the backend payload for a job, folding in the resolved proxy and
    /// identity as spider arguments
    pub fn from_job(job: &Job) -> Self {
        let mut args = job.args.clone();
        if let Some(proxy) = &job.proxy {
            args.insert("proxy".to_string(), proxy.clone());
        }
        if let Some(identity) = &job.identity {
            args.insert("user_agent".to_string(), identity.clone());
        }
        Self {
            project: job.project.clone(),
            spider: job.spider.clone(),
            job_id: job.job_id.clone(),
            version: job.version.clone(),
            settings: job.settings.clone(),
            args,
        }
    }

    /// Add a setting override
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}
