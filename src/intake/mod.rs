//! Asynchronous task intake
//!
//! Producers push task messages onto a durable queue; [`IntakeService`]
//! workers pull them, hand them to the scheduler and settle each delivery:
//!
//! - dispatched, duplicate or definitively rejected: ack
//! - transient rejection (no capacity, no browser session, backends
//!   unreachable): requeue after a delay
//! - malformed body: dead-letter
//!
//! A message is removed from the queue only once it has been settled, so a
//! crashed worker's in-flight messages are recovered on the next start.

pub mod memory;
pub mod redis_queue;
pub mod service;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind};
use crate::models::{deserialize_string_map, JobRequest};

pub use memory::MemoryBroker;
pub use redis_queue::RedisQueueBroker;
pub use service::{Disposition, IntakeService};

// ============================================================================
// Messages
// ============================================================================

/// Task message body as published by producers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Idempotency key, becomes the job id
    pub task_id: String,

    pub project: String,

    pub spider: String,

    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub settings: HashMap<String, String>,

    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub args: HashMap<String, String>,

    /// Informational; consumption order is FIFO
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(default, alias = "device_class", skip_serializing_if = "Option::is_none")]
    pub user_agent_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_family: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<bool>,
}

impl TaskMessage {
    pub fn new(task_id: impl Into<String>, project: impl Into<String>, spider: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            project: project.into(),
            spider: spider.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a raw body
    pub fn parse(body: &str) -> Result<Self, IntakeError> {
        let message: TaskMessage =
            serde_json::from_str(body).map_err(|e| IntakeError::Malformed(e.to_string()))?;
        if message.task_id.trim().is_empty() {
            return Err(IntakeError::Malformed("task_id must not be empty".to_string()));
        }
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, IntakeError> {
        serde_json::to_string(self).map_err(|e| IntakeError::Malformed(e.to_string()))
    }

    /// Convert into a scheduler request
    pub fn into_request(self) -> JobRequest {
        JobRequest {
            job_id: Some(self.task_id),
            project: self.project,
            spider: self.spider,
            version: self.version,
            settings: self.settings,
            args: self.args,
            proxy: self.proxy,
            user_agent: self.user_agent,
            user_agent_type: self.user_agent_type,
            browser_family: self.browser_family,
            browser: self.browser,
            priority: self.priority,
        }
    }
}

/// A message taken from the queue but not yet settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-specific handle used to settle the delivery
    pub tag: String,
    pub body: String,
}

/// Message counts by list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
    pub dead: usize,
}

// ============================================================================
// Broker
// ============================================================================

/// Reliable queue with explicit settlement
#[async_trait]
pub trait MessageBroker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Append a message to the queue
    async fn publish(&self, body: &str) -> Result<(), IntakeError>;

    /// Take the oldest ready message, if any, without waiting
    async fn receive(&self) -> Result<Option<Delivery>, IntakeError>;

    /// Remove a settled delivery
    async fn ack(&self, delivery: &Delivery) -> Result<(), IntakeError>;

    /// Return a delivery to the queue, or dead-letter it when `requeue` is false
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), IntakeError>;

    /// Move deliveries left in flight by a previous run back to the queue
    async fn recover(&self) -> Result<usize, IntakeError>;

    async fn depth(&self) -> Result<QueueDepth, IntakeError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Intake errors
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Malformed task message: {0}")]
    Malformed(String),

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

impl ClassifiedError for IntakeError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) => ErrorKind::InvalidRequest,
            Self::Redis(_) | Self::Pool(_) | Self::UnknownDelivery(_) => ErrorKind::Broker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message() {
        let body = r#"{
            "task_id": "t-1",
            "project": "demo",
            "spider": "quotes",
            "settings": {"DOWNLOAD_DELAY": 2},
            "args": {"page": "1"},
            "priority": 5,
            "device_class": "mobile"
        }"#;

        let message = TaskMessage::parse(body).unwrap();
        assert_eq!(message.settings.get("DOWNLOAD_DELAY").map(String::as_str), Some("2"));
        assert_eq!(message.user_agent_type.as_deref(), Some("mobile"));

        let request = message.into_request();
        assert_eq!(request.job_id.as_deref(), Some("t-1"));
        assert_eq!(request.priority, 5);
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(TaskMessage::parse("not json"), Err(IntakeError::Malformed(_))));
        assert!(TaskMessage::parse(r#"{"project":"demo","spider":"q"}"#).is_err());
        assert!(TaskMessage::parse(r#"{"task_id":" ","project":"demo","spider":"q"}"#).is_err());
    }

    #[test]
    fn test_serialized_message_parses_back() {
        let message = TaskMessage::new("t-2", "demo", "quotes");
        let json = message.to_json().unwrap();
        assert!(!json.contains("proxy"));
        assert_eq!(TaskMessage::parse(&json).unwrap(), message);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(IntakeError::Malformed("x".to_string()).kind(), ErrorKind::InvalidRequest);
        assert_eq!(IntakeError::Pool("x".to_string()).kind(), ErrorKind::Broker);
    }
}
