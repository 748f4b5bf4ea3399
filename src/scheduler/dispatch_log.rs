//! Durable record of dispatched job ids
//!
//! The local [`JobTable`](super::JobTable) dies with the process, so on its
//! own it cannot stop a redelivered message from being dispatched twice after
//! a crash between submit and ack. The dispatch log closes that gap:
//!
//! - `claim` reserves a job id before placement (expires after `claim_ttl`)
//! - `commit` records the node once a backend accepted the job
//! - `forget` drops an uncommitted claim when placement failed
//!
//! [`RedisDispatchLog`] lives next to the admission ledger and is shared by
//! every replica. [`MemoryDispatchLog`] only covers one process.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::admission::LedgerError;
use crate::config::{LedgerBackend, LedgerConfig};

/// Result of claiming a job id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the job id and may dispatch it
    Claimed,
    /// A backend already accepted this job id
    Dispatched { node: String },
    /// Another placement holds an uncommitted claim
    InFlight,
}

/// Store of claimed and dispatched job ids
#[async_trait]
pub trait DispatchLog: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the record outlives this process
    fn is_durable(&self) -> bool;

    async fn claim(&self, job_id: &str, ttl: Duration) -> Result<Claim, LedgerError>;

    async fn commit(&self, job_id: &str, node: &str, retention: Duration) -> Result<(), LedgerError>;

    /// Remove an uncommitted claim; committed entries are kept
    async fn forget(&self, job_id: &str) -> Result<(), LedgerError>;
}

/// Build the dispatch log matching the ledger backend
pub async fn build_dispatch_log(config: &LedgerConfig) -> Result<Arc<dyn DispatchLog>, LedgerError> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryDispatchLog::new())),
        LedgerBackend::Redis => Ok(Arc::new(RedisDispatchLog::connect(config).await?)),
    }
}

// ============================================================================
// In-process log
// ============================================================================

#[derive(Debug)]
struct Entry {
    node: Option<String>,
    expires_at: Instant,
}

/// Dispatch log for a single process
#[derive(Default)]
pub struct MemoryDispatchLog {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryDispatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DispatchLog for MemoryDispatchLog {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn claim(&self, job_id: &str, ttl: Duration) -> Result<Claim, LedgerError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.expires_at > now);

        if let Some(entry) = entries.get(job_id) {
            return Ok(match &entry.node {
                Some(node) => Claim::Dispatched { node: node.clone() },
                None => Claim::InFlight,
            });
        }
        entries.insert(
            job_id.to_string(),
            Entry {
                node: None,
                expires_at: now + ttl,
            },
        );
        Ok(Claim::Claimed)
    }

    async fn commit(&self, job_id: &str, node: &str, retention: Duration) -> Result<(), LedgerError> {
        self.entries.lock().await.insert(
            job_id.to_string(),
            Entry {
                node: Some(node.to_string()),
                expires_at: Instant::now() + retention,
            },
        );
        Ok(())
    }

    async fn forget(&self, job_id: &str) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().await;
        if entries.get(job_id).is_some_and(|e| e.node.is_none()) {
            entries.remove(job_id);
        }
        Ok(())
    }
}

// ============================================================================
// Redis log
// ============================================================================

const CLAIMED: &str = "claimed";
const NODE_PREFIX: &str = "node:";

const CLAIM: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    return current
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return ''
"#;

const FORGET: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Dispatch log shared through Redis
///
/// One string key per job id, `{prefix}:dispatch:{job_id}`, holding either
/// `claimed` (with the claim TTL) or `node:{id}` (with the retention TTL).
pub struct RedisDispatchLog {
    pool: Pool,
    prefix: String,
    claim: Script,
    forget: Script,
}

impl RedisDispatchLog {
    /// Connect using the ledger's Redis settings
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let pool = PoolConfig::from_url(&config.redis_url)
            .builder()
            .map_err(|e| LedgerError::Pool(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| LedgerError::Pool(format!("Failed to create Redis connection pool: {e}")))?;

        let log = Self::with_pool(pool, &config.key_prefix);
        let mut conn = log.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        tracing::info!(prefix = %config.key_prefix, "Connected to Redis dispatch log");
        Ok(log)
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: Pool, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
            claim: Script::new(CLAIM),
            forget: Script::new(FORGET),
        }
    }

    fn key(&self, job_id: &str) -> String {
        format!("{}:dispatch:{}", self.prefix, job_id)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, LedgerError> {
        self.pool
            .get()
            .await
            .map_err(|e| LedgerError::Pool(e.to_string()))
    }
}

/// Interpret the value stored under a dispatch key
fn parse_claim(value: &str) -> Result<Claim, LedgerError> {
    if value.is_empty() {
        Ok(Claim::Claimed)
    } else if value == CLAIMED {
        Ok(Claim::InFlight)
    } else if let Some(node) = value.strip_prefix(NODE_PREFIX) {
        Ok(Claim::Dispatched {
            node: node.to_string(),
        })
    } else {
        Err(LedgerError::Protocol(format!("unexpected dispatch record '{value}'")))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl DispatchLog for RedisDispatchLog {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn claim(&self, job_id: &str, ttl: Duration) -> Result<Claim, LedgerError> {
        let mut conn = self.conn().await?;
        let value: String = self
            .claim
            .key(self.key(job_id))
            .arg(CLAIMED)
            .arg(millis(ttl))
            .invoke_async(&mut *conn)
            .await?;
        parse_claim(&value)
    }

    async fn commit(&self, job_id: &str, node: &str, retention: Duration) -> Result<(), LedgerError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key(job_id))
            .arg(format!("{NODE_PREFIX}{node}"))
            .arg("PX")
            .arg(millis(retention))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn forget(&self, job_id: &str) -> Result<(), LedgerError> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .forget
            .key(self.key(job_id))
            .arg(CLAIMED)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }
}
