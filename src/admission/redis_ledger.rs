//! Redis-backed ledger shared by every gateway replica
//!
//! Every operation is one Lua script, so check-and-grant, release-and-hand-off
//! and sweep-and-pump are atomic with respect to all replicas. Scripts read
//! the Redis server clock (`TIME`), which gives replicas a single time source
//! for lease expiry.
//!
//! Key layout under `{prefix}`:
//!
//! - `:lease:{id}`  hash (holder, acquired_at, ttl, renewed_at)
//! - `:expiry`      zset lease id -> expires_at_ms (its cardinality is the slot count)
//! - `:holders`     hash holder -> lease id
//! - `:queue`       list of waiting holders, head first
//! - `:queued`      zset holder -> enqueued_at_ms
//! - `:seq`         lease id counter

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;

use super::ledger::{
    AcquireOutcome, ExpiredLease, Lease, LeasePolicy, LedgerStatus, ReleaseOutcome,
    ResourceLedger, SweepOutcome, WaitQueueEntry,
};
use super::LedgerError;
use crate::config::LedgerConfig;

// ============================================================================
// Scripts
// ============================================================================

const PRELUDE: &str = r#"
local prefix = KEYS[1]
local expiry_key = prefix .. ':expiry'
local holders_key = prefix .. ':holders'
local queue_key = prefix .. ':queue'
local queued_key = prefix .. ':queued'

local function now_ms()
    local t = redis.call('TIME')
    return tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local function lease_key(id)
    return prefix .. ':lease:' .. id
end

local function grant(holder, ttl, now)
    local id = 'lease-' .. redis.call('INCR', prefix .. ':seq')
    redis.call('HSET', lease_key(id), 'holder', holder, 'acquired_at', now, 'ttl', ttl, 'renewed_at', now)
    redis.call('ZADD', expiry_key, now + ttl, id)
    redis.call('HSET', holders_key, holder, id)
    return id
end

local function dequeue(holder)
    redis.call('LREM', queue_key, 0, holder)
    redis.call('ZREM', queued_key, holder)
end

local function pump(max, ttl, now)
    local granted = {}
    while redis.call('ZCARD', expiry_key) < max do
        local head = redis.call('LPOP', queue_key)
        if not head then
            break
        end
        redis.call('ZREM', queued_key, head)
        if redis.call('HEXISTS', holders_key, head) == 0 then
            grant(head, ttl, now)
            granted[#granted + 1] = head
        end
    end
    return granted
end

local function lease_reply(tag, id)
    local f = redis.call('HMGET', lease_key(id), 'holder', 'acquired_at', 'ttl', 'renewed_at')
    return {tag, id, f[1] or '', f[2] or '0', f[3] or '0', f[4] or '0'}
end
"#;

const ACQUIRE: &str = r#"
local holder = ARGV[1]
local max = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local now = now_ms()
pump(max, ttl, now)

local existing = redis.call('HGET', holders_key, holder)
if existing then
    dequeue(holder)
    redis.call('HSET', lease_key(existing), 'renewed_at', now, 'ttl', ttl)
    redis.call('ZADD', expiry_key, now + ttl, existing)
    return lease_reply('granted', existing)
end

if redis.call('ZCARD', expiry_key) < max then
    return lease_reply('granted', grant(holder, ttl, now))
end

if not redis.call('ZSCORE', queued_key, holder) then
    redis.call('RPUSH', queue_key, holder)
    redis.call('ZADD', queued_key, now, holder)
end
return {'queued', tostring(redis.call('LPOS', queue_key, holder) + 1)}
"#;

const POLL: &str = r#"
local holder = ARGV[1]
local max = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
pump(max, ttl, now_ms())

local existing = redis.call('HGET', holders_key, holder)
if existing then
    return lease_reply('granted', existing)
end
local pos = redis.call('LPOS', queue_key, holder)
if not pos then
    return {'not_queued'}
end
return {'queued', tostring(pos + 1)}
"#;

const RELEASE: &str = r#"
local id = ARGV[1]
local max = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local now = now_ms()

local released = '0'
local holder = redis.call('HGET', lease_key(id), 'holder')
if holder then
    redis.call('DEL', lease_key(id))
    if redis.call('HGET', holders_key, holder) == id then
        redis.call('HDEL', holders_key, holder)
    end
    released = '1'
end
redis.call('ZREM', expiry_key, id)

local reply = {released}
for _, h in ipairs(pump(max, ttl, now)) do
    reply[#reply + 1] = h
end
return reply
"#;

const RENEW: &str = r#"
local id = ARGV[1]
local ttl = tonumber(ARGV[2])
local now = now_ms()

local expires = redis.call('ZSCORE', expiry_key, id)
if not expires or tonumber(expires) <= now then
    return {}
end
redis.call('HSET', lease_key(id), 'renewed_at', now, 'ttl', ttl)
redis.call('ZADD', expiry_key, now + ttl, id)
return lease_reply('granted', id)
"#;

const ABANDON: &str = r#"
local holder = ARGV[1]
dequeue(holder)
local existing = redis.call('HGET', holders_key, holder)
if existing then
    return lease_reply('granted', existing)
end
return {}
"#;

const SWEEP: &str = r#"
local max = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local now = now_ms()

local expired = redis.call('ZRANGEBYSCORE', expiry_key, '-inf', now)
local reply = {tostring(#expired)}
for _, id in ipairs(expired) do
    local holder = redis.call('HGET', lease_key(id), 'holder') or ''
    redis.call('DEL', lease_key(id))
    redis.call('ZREM', expiry_key, id)
    if holder ~= '' and redis.call('HGET', holders_key, holder) == id then
        redis.call('HDEL', holders_key, holder)
    end
    reply[#reply + 1] = id
    reply[#reply + 1] = holder
end
for _, h in ipairs(pump(max, ttl, now)) do
    reply[#reply + 1] = h
end
return reply
"#;

const STATUS: &str = r#"
local now = now_ms()
local ids = redis.call('ZRANGE', expiry_key, 0, -1)
local reply = {tostring(now), tostring(#ids)}
for _, id in ipairs(ids) do
    local l = lease_reply('lease', id)
    for i = 2, 6 do
        reply[#reply + 1] = l[i]
    end
end
for _, h in ipairs(redis.call('LRANGE', queue_key, 0, -1)) do
    reply[#reply + 1] = h
    reply[#reply + 1] = redis.call('ZSCORE', queued_key, h) or '0'
end
return reply
"#;

const RESET: &str = r#"
for _, id in ipairs(redis.call('ZRANGE', expiry_key, 0, -1)) do
    redis.call('DEL', lease_key(id))
end
redis.call('DEL', expiry_key, holders_key, queue_key, queued_key)
return 'OK'
"#;

struct Scripts {
    acquire: Script,
    poll: Script,
    release: Script,
    renew: Script,
    abandon: Script,
    sweep: Script,
    status: Script,
    reset: Script,
}

impl Scripts {
    fn load() -> Self {
        let build = |body: &str| Script::new(&format!("{PRELUDE}\n{body}"));
        Self {
            acquire: build(ACQUIRE),
            poll: build(POLL),
            release: build(RELEASE),
            renew: build(RENEW),
            abandon: build(ABANDON),
            sweep: build(SWEEP),
            status: build(STATUS),
            reset: build(RESET),
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Ledger stored in Redis
pub struct RedisLedger {
    pool: Pool,
    prefix: String,
    scripts: Scripts,
}

impl RedisLedger {
    /// Create the connection pool and check connectivity
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let pool = PoolConfig::from_url(&config.redis_url)
            .builder()
            .map_err(|e| LedgerError::Pool(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| LedgerError::Pool(format!("Failed to create Redis connection pool: {e}")))?;

        let ledger = Self::with_pool(pool, &config.key_prefix);

        let mut conn = ledger.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        tracing::info!(url = %config.redis_url, prefix = %config.key_prefix, "Connected to Redis ledger");
        Ok(ledger)
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: Pool, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
            scripts: Scripts::load(),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, LedgerError> {
        self.pool
            .get()
            .await
            .map_err(|e| LedgerError::Pool(e.to_string()))
    }
}

#[async_trait]
impl ResourceLedger for RedisLedger {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn acquire(&self, holder: &str, policy: LeasePolicy) -> Result<AcquireOutcome, LedgerError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .scripts
            .acquire
            .key(&self.prefix)
            .arg(holder)
            .arg(policy.max)
            .arg(policy.ttl_ms)
            .invoke_async(&mut *conn)
            .await?;
        parse_outcome(&reply)
    }

    async fn poll(&self, holder: &str, policy: LeasePolicy) -> Result<AcquireOutcome, LedgerError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .scripts
            .poll
            .key(&self.prefix)
            .arg(holder)
            .arg(policy.max)
            .arg(policy.ttl_ms)
            .invoke_async(&mut *conn)
            .await?;
        parse_outcome(&reply)
    }

    async fn release(&self, lease_id: &str, policy: LeasePolicy) -> Result<ReleaseOutcome, LedgerError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .scripts
            .release
            .key(&self.prefix)
            .arg(lease_id)
            .arg(policy.max)
            .arg(policy.ttl_ms)
            .invoke_async(&mut *conn)
            .await?;

        let (flag, granted) = reply
            .split_first()
            .ok_or_else(|| LedgerError::Protocol("empty release reply".to_string()))?;
        Ok(ReleaseOutcome {
            released: flag == "1",
            granted: granted.to_vec(),
        })
    }

    async fn renew(&self, lease_id: &str, ttl_ms: u64) -> Result<Option<Lease>, LedgerError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .scripts
            .renew
            .key(&self.prefix)
            .arg(lease_id)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;
        optional_lease(&reply)
    }

    async fn abandon(&self, holder: &str) -> Result<Option<Lease>, LedgerError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .scripts
            .abandon
            .key(&self.prefix)
            .arg(holder)
            .invoke_async(&mut *conn)
            .await?;
        optional_lease(&reply)
    }

    async fn sweep(&self, policy: LeasePolicy) -> Result<SweepOutcome, LedgerError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .scripts
            .sweep
            .key(&self.prefix)
            .arg(policy.max)
            .arg(policy.ttl_ms)
            .invoke_async(&mut *conn)
            .await?;
        parse_sweep(&reply)
    }

    async fn status(&self) -> Result<LedgerStatus, LedgerError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .scripts
            .status
            .key(&self.prefix)
            .invoke_async(&mut *conn)
            .await?;
        parse_status(&reply)
    }

    async fn reset(&self) -> Result<(), LedgerError> {
        let mut conn = self.conn().await?;
        let _: () = self
            .scripts
            .reset
            .key(&self.prefix)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Reply parsing
// ============================================================================

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, LedgerError> {
    value
        .parse()
        .map_err(|_| LedgerError::Protocol(format!("bad {what}: '{value}'")))
}

/// Scores come back as doubles and may be rendered with an exponent
fn parse_millis(value: &str) -> Result<i64, LedgerError> {
    match value.parse::<i64>() {
        Ok(ms) => Ok(ms),
        Err(_) => parse_number::<f64>(value, "timestamp").map(|f| f as i64),
    }
}

/// `[id, holder, acquired_at, ttl, renewed_at]`
fn parse_lease(fields: &[String]) -> Result<Lease, LedgerError> {
    let [id, holder, acquired, ttl, renewed] = fields else {
        return Err(LedgerError::Protocol(format!(
            "lease reply has {} fields",
            fields.len()
        )));
    };
    Ok(Lease {
        lease_id: id.clone(),
        holder: holder.clone(),
        acquired_at_ms: parse_millis(acquired)?,
        ttl_ms: parse_number(ttl, "ttl")?,
        renewed_at_ms: parse_millis(renewed)?,
    })
}

fn parse_outcome(reply: &[String]) -> Result<AcquireOutcome, LedgerError> {
    match reply.split_first() {
        Some((tag, rest)) if tag == "granted" => parse_lease(rest).map(AcquireOutcome::Granted),
        Some((tag, [position])) if tag == "queued" => Ok(AcquireOutcome::Queued {
            position: parse_number(position, "queue position")?,
        }),
        Some((tag, [])) if tag == "not_queued" => Ok(AcquireOutcome::NotQueued),
        _ => Err(LedgerError::Protocol(format!("unexpected reply {reply:?}"))),
    }
}

fn optional_lease(reply: &[String]) -> Result<Option<Lease>, LedgerError> {
    if reply.is_empty() {
        return Ok(None);
    }
    match parse_outcome(reply)? {
        AcquireOutcome::Granted(lease) => Ok(Some(lease)),
        _ => Err(LedgerError::Protocol(format!("unexpected reply {reply:?}"))),
    }
}

/// `[n, (id, holder) * n, granted...]`
fn parse_sweep(reply: &[String]) -> Result<SweepOutcome, LedgerError> {
    let (count, rest) = reply
        .split_first()
        .ok_or_else(|| LedgerError::Protocol("empty sweep reply".to_string()))?;
    let count: usize = parse_number(count, "expired count")?;
    if rest.len() < count * 2 {
        return Err(LedgerError::Protocol("truncated sweep reply".to_string()));
    }

    let (pairs, granted) = rest.split_at(count * 2);
    let expired = pairs
        .chunks_exact(2)
        .map(|pair| ExpiredLease {
            lease_id: pair[0].clone(),
            holder: pair[1].clone(),
        })
        .collect();

    Ok(SweepOutcome {
        expired,
        granted: granted.to_vec(),
    })
}

/// `[now, n, (lease fields) * n, (holder, enqueued_at) * m]`
fn parse_status(reply: &[String]) -> Result<LedgerStatus, LedgerError> {
    let [now, count, rest @ ..] = reply else {
        return Err(LedgerError::Protocol("short status reply".to_string()));
    };
    let count: usize = parse_number(count, "lease count")?;
    if rest.len() < count * 5 || (rest.len() - count * 5) % 2 != 0 {
        return Err(LedgerError::Protocol("malformed status reply".to_string()));
    }

    let (lease_fields, queue_fields) = rest.split_at(count * 5);
    let leases = lease_fields
        .chunks_exact(5)
        .map(parse_lease)
        .collect::<Result<Vec<_>, _>>()?;
    let queue = queue_fields
        .chunks_exact(2)
        .map(|pair| {
            Ok(WaitQueueEntry {
                job_id: pair[0].clone(),
                enqueued_at_ms: parse_millis(&pair[1])?,
            })
        })
        .collect::<Result<Vec<_>, LedgerError>>()?;

    Ok(LedgerStatus {
        now_ms: parse_millis(now)?,
        leases,
        queue,
    })
}
