//! Proxy and identity rotation
//!
//! Append-mostly catalogs of egress proxies and client identity strings.
//! Selection is uniform at random among eligible entries and bumps usage
//! counters; failures bias future selection but never remove an entry.
//!
//! With `rotation.state_file` set, both catalogs and their counters survive
//! restarts: catalog changes are written immediately, usage counters by a
//! periodic flush.

mod catalog;
pub mod health;
pub mod state;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::RotationConfig;
use crate::error::{ClassifiedError, ErrorKind};
use crate::models::JobRequest;

pub use catalog::DEFAULT_IDENTITIES;
pub use health::ProxyHealthChecker;
pub use state::RotationState;

// ============================================================================
// Records
// ============================================================================

/// An egress proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub url: String,
    pub failure_count: u32,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            failure_count: 0,
            usage_count: 0,
            last_used_at: None,
            last_failed_at: None,
            last_checked_at: None,
        }
    }
}

/// A client identity string with its facets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub value: String,
    pub device_class: String,
    pub browser_family: String,
    #[serde(default)]
    pub usage_count: u64,
}

impl IdentityRecord {
    pub fn new(value: impl Into<String>, device_class: impl Into<String>, browser_family: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            device_class: device_class.into().to_ascii_lowercase(),
            browser_family: browser_family.into().to_ascii_lowercase(),
            usage_count: 0,
        }
    }

    fn same_entry(&self, other: &IdentityRecord) -> bool {
        self.value == other.value
            && self.device_class == other.device_class
            && self.browser_family == other.browser_family
    }

    fn matches(&self, device_class: Option<&str>, browser_family: Option<&str>) -> bool {
        device_class.map_or(true, |d| self.device_class.eq_ignore_ascii_case(d))
            && browser_family.map_or(true, |b| self.browser_family.eq_ignore_ascii_case(b))
    }
}

/// Proxy and identity chosen for one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRotation {
    pub proxy: Option<String>,
    pub identity: Option<String>,
}

/// Catalog view for the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationCatalog {
    pub proxy_rotation_enabled: bool,
    pub identity_rotation_enabled: bool,
    pub proxy_failure_threshold: u32,
    pub proxies: Vec<ProxyRecord>,
    pub identities: Vec<IdentityRecord>,
}

// ============================================================================
// Rotation Store
// ============================================================================

/// Stateful proxy and identity catalog
pub struct RotationStore {
    proxies: RwLock<Vec<ProxyRecord>>,
    identities: RwLock<Vec<IdentityRecord>>,
    config: RotationConfig,
    /// Counters changed since the last save
    dirty: AtomicBool,
    save_lock: Mutex<()>,
}

impl RotationStore {
    /// Seed the catalogs from configuration (built-in identities when none are listed)
    ///
    /// Does not read `state_file`; see [`RotationStore::open`].
    pub fn from_config(config: &RotationConfig) -> Self {
        let (proxies, identities) = seed(config);
        Self::with_catalogs(config, proxies, identities)
    }

    /// Seed from configuration, then restore the saved state if there is one
    pub async fn open(config: &RotationConfig) -> Result<Self, RotationError> {
        let (mut proxies, mut identities) = seed(config);

        if let Some(path) = &config.state_file {
            match RotationState::load(path).await? {
                Some(saved) => {
                    saved.merge_into(&mut proxies, &mut identities);
                    tracing::info!(
                        path = %path.display(),
                        proxies = proxies.len(),
                        identities = identities.len(),
                        "Rotation state restored"
                    );
                }
                None => tracing::info!(path = %path.display(), "No rotation state yet"),
            }
        }

        let store = Self::with_catalogs(config, proxies, identities);
        store.persist().await?;
        Ok(store)
    }

    fn with_catalogs(config: &RotationConfig, proxies: Vec<ProxyRecord>, identities: Vec<IdentityRecord>) -> Self {
        Self {
            proxies: RwLock::new(proxies),
            identities: RwLock::new(identities),
            config: config.clone(),
            dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        }
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.config.state_file.as_deref()
    }

    /// Write both catalogs to the state file (no-op without one)
    pub async fn persist(&self) -> Result<(), RotationError> {
        let Some(path) = self.state_file() else {
            return Ok(());
        };

        let _guard = self.save_lock.lock().await;
        self.dirty.store(false, Ordering::Release);
        let state = RotationState {
            saved_at: Some(Utc::now()),
            proxies: self.proxies.read().await.clone(),
            identities: self.identities.read().await.clone(),
        };

        let saved = state.save(path).await;
        if saved.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        saved
    }

    /// Persist only when counters changed since the last save
    pub async fn flush(&self) -> Result<bool, RotationError> {
        if self.state_file().is_none() || !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to save rotation state");
        }
    }

    /// Spawn the periodic counter flush; `None` without a state file
    ///
    /// Flushes once more on shutdown.
    pub fn spawn_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        self.state_file()?;
        let period = self.config.state_flush_interval();

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            tracing::warn!(error = %e, "Failed to flush rotation state");
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = self.flush().await {
                            tracing::warn!(error = %e, "Failed to flush rotation state on shutdown");
                        }
                        tracing::debug!("Rotation flusher shutting down");
                        break;
                    }
                }
            }
        }))
    }

    /// Pick a proxy; an explicit pin is returned unchanged
    ///
    /// Chooses at random among proxies below the failure threshold. When every
    /// proxy is at or above it, the least recently failed one is used rather
    /// than failing the job. `None` only when the pool is empty.
    pub async fn select_proxy(&self, pin: Option<&str>) -> Option<String> {
        if let Some(pin) = pin {
            return Some(pin.to_string());
        }

        let mut proxies = self.proxies.write().await;
        let index = pick_proxy(&proxies, self.config.proxy_failure_threshold)?;
        let record = &mut proxies[index];
        record.usage_count += 1;
        record.last_used_at = Some(Utc::now());
        self.dirty.store(true, Ordering::Release);
        Some(record.url.clone())
    }

    /// Pick an identity matching the given facets (omitted facets are unconstrained)
    pub async fn select_identity(
        &self,
        device_class: Option<&str>,
        browser_family: Option<&str>,
        pin: Option<&str>,
    ) -> Result<String, RotationError> {
        if let Some(pin) = pin {
            return Ok(pin.to_string());
        }

        let mut identities = self.identities.write().await;
        let candidates: Vec<usize> = identities
            .iter()
            .enumerate()
            .filter(|(_, i)| i.matches(device_class, browser_family))
            .map(|(index, _)| index)
            .collect();

        let Some(&index) = candidates.choose(&mut rand::thread_rng()) else {
            return Err(RotationError::NoMatch {
                device_class: device_class.map(str::to_string),
                browser_family: browser_family.map(str::to_string),
            });
        };

        let record = &mut identities[index];
        record.usage_count += 1;
        self.dirty.store(true, Ordering::Release);
        Ok(record.value.clone())
    }

    /// Resolve proxy and identity for a job, honouring pins, rotation flags
    /// and configured defaults
    pub async fn resolve(&self, request: &JobRequest) -> ResolvedRotation {
        let proxy = match request.proxy.as_deref() {
            Some(pin) => Some(pin.to_string()),
            None if self.config.proxy_rotation_enabled => self
                .select_proxy(None)
                .await
                .or_else(|| self.config.default_proxy.clone()),
            None => self.config.default_proxy.clone(),
        };

        let identity = match request.user_agent.as_deref() {
            Some(pin) => Some(pin.to_string()),
            None if self.config.identity_rotation_enabled => {
                let device = request.user_agent_type.as_deref();
                let browser = request.browser_family.as_deref();
                match self.select_identity(device, browser, None).await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::debug!(error = %e, "No identity for facets, using full catalog");
                        self.select_identity(None, None, None)
                            .await
                            .ok()
                            .or_else(|| self.config.default_identity.clone())
                    }
                }
            }
            None => self.config.default_identity.clone(),
        };

        ResolvedRotation { proxy, identity }
    }

    /// Add a proxy; returns false when it is already present
    pub async fn add_proxy(&self, url: &str) -> Result<bool, RotationError> {
        let parsed = url::Url::parse(url).map_err(|e| RotationError::InvalidProxy {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(RotationError::InvalidProxy {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        {
            let mut proxies = self.proxies.write().await;
            if proxies.iter().any(|p| p.url == url) {
                return Ok(false);
            }
            proxies.push(ProxyRecord::new(url));
        }
        tracing::info!(url, "Proxy added to rotation");
        self.persist_or_warn().await;
        Ok(true)
    }

    /// Current proxy URLs
    pub async fn proxy_urls(&self) -> Vec<String> {
        self.proxies.read().await.iter().map(|p| p.url.clone()).collect()
    }

    /// Count a failure against a proxy
    pub async fn record_proxy_failure(&self, url: &str) -> Result<ProxyRecord, RotationError> {
        let updated = {
            let mut proxies = self.proxies.write().await;
            let record = proxies
                .iter_mut()
                .find(|p| p.url == url)
                .ok_or_else(|| RotationError::UnknownProxy(url.to_string()))?;

            record.failure_count = record.failure_count.saturating_add(1);
            record.last_failed_at = Some(Utc::now());
            if record.failure_count == self.config.proxy_failure_threshold {
                tracing::warn!(url, failures = record.failure_count, "Proxy reached failure threshold");
            }
            record.clone()
        };
        self.persist_or_warn().await;
        Ok(updated)
    }

    /// Clear a proxy's failure count after it passed a health check
    pub async fn record_proxy_healthy(&self, url: &str) -> Result<ProxyRecord, RotationError> {
        let (updated, recovered) = {
            let mut proxies = self.proxies.write().await;
            let record = proxies
                .iter_mut()
                .find(|p| p.url == url)
                .ok_or_else(|| RotationError::UnknownProxy(url.to_string()))?;

            let recovered = record.failure_count >= self.config.proxy_failure_threshold;
            record.failure_count = 0;
            record.last_checked_at = Some(Utc::now());
            (record.clone(), recovered)
        };
        if recovered {
            tracing::info!(url, "Proxy healthy again");
        }
        self.dirty.store(true, Ordering::Release);
        Ok(updated)
    }

    /// Add an identity; returns false when the same value and facets exist
    pub async fn add_identity(&self, record: IdentityRecord) -> Result<bool, RotationError> {
        if record.value.trim().is_empty() {
            return Err(RotationError::InvalidIdentity("value must not be empty".to_string()));
        }
        let record = IdentityRecord::new(record.value, record.device_class, record.browser_family);

        {
            let mut identities = self.identities.write().await;
            if identities.iter().any(|i| i.same_entry(&record)) {
                return Ok(false);
            }
            identities.push(record);
        }
        self.persist_or_warn().await;
        Ok(true)
    }

    /// Snapshot of both catalogs
    pub async fn catalog(&self) -> RotationCatalog {
        RotationCatalog {
            proxy_rotation_enabled: self.config.proxy_rotation_enabled,
            identity_rotation_enabled: self.config.identity_rotation_enabled,
            proxy_failure_threshold: self.config.proxy_failure_threshold,
            proxies: self.proxies.read().await.clone(),
            identities: self.identities.read().await.clone(),
        }
    }
}

fn seed(config: &RotationConfig) -> (Vec<ProxyRecord>, Vec<IdentityRecord>) {
    let mut proxies: Vec<ProxyRecord> = Vec::new();
    for url in &config.proxies {
        if !proxies.iter().any(|p| &p.url == url) {
            proxies.push(ProxyRecord::new(url.clone()));
        }
    }

    let identities = if config.identities.is_empty() {
        DEFAULT_IDENTITIES
            .iter()
            .map(|(device, browser, value)| IdentityRecord::new(*value, *device, *browser))
            .collect()
    } else {
        config
            .identities
            .iter()
            .map(|i| IdentityRecord::new(i.value.clone(), i.device_class.clone(), i.browser_family.clone()))
            .collect()
    };

    (proxies, identities)
}

fn pick_proxy(proxies: &[ProxyRecord], threshold: u32) -> Option<usize> {
    let healthy: Vec<usize> = proxies
        .iter()
        .enumerate()
        .filter(|(_, p)| p.failure_count < threshold)
        .map(|(index, _)| index)
        .collect();

    if let Some(&index) = healthy.choose(&mut rand::thread_rng()) {
        return Some(index);
    }

    // Never failed sorts first (None < Some)
    proxies
        .iter()
        .enumerate()
        .min_by_key(|(_, p)| p.last_failed_at)
        .map(|(index, _)| index)
}

// ============================================================================
// Errors
// ============================================================================

/// Rotation errors
#[derive(Error, Debug, Clone)]
pub enum RotationError {
    #[error("No identity matches device_class={device_class:?} browser_family={browser_family:?}")]
    NoMatch {
        device_class: Option<String>,
        browser_family: Option<String>,
    },

    #[error("Unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("Invalid proxy URL '{url}': {reason}")]
    InvalidProxy { url: String, reason: String },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Rotation state file '{path}': {reason}")]
    State { path: String, reason: String },
}

impl RotationError {
    fn state(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::State {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ClassifiedError for RotationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NoMatch { .. } | Self::UnknownProxy(_) => ErrorKind::NotFound,
            Self::InvalidProxy { .. } | Self::InvalidIdentity(_) => ErrorKind::InvalidRequest,
            Self::State { .. } => ErrorKind::Internal,
        }
    }
}
