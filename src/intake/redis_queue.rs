//! Redis list-based reliable queue
//!
//! Key layout, relative to the configured queue name `Q`:
//!
//! - `Q`: ready messages; producers `LPUSH`, consumers take from the right
//! - `Q:processing:<consumer>`: deliveries taken but not yet settled
//! - `Q:dead`: dead-lettered bodies
//!
//! Taking a message is a single `LMOVE` into the processing list, so a crash
//! between receive and ack leaves the body there for [`recover`].
//!
//! [`recover`]: MessageBroker::recover

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;

use super::{Delivery, IntakeError, MessageBroker, QueueDepth};
use crate::config::IntakeConfig;

/// Remove one copy from the processing list, then push it to the target list
const SETTLE_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], -1, ARGV[1]) == 0 then
    return 0
end
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
";

/// Durable queue on Redis lists
pub struct RedisQueueBroker {
    pool: Pool,
    queue: String,
    processing: String,
    dead: String,
    settle: Script,
}

impl RedisQueueBroker {
    /// Create the connection pool and check connectivity
    pub async fn connect(redis_url: &str, config: &IntakeConfig) -> Result<Self, IntakeError> {
        let pool = PoolConfig::from_url(redis_url)
            .builder()
            .map_err(|e| IntakeError::Pool(format!("Failed to create pool builder: {e}")))?
            .max_size(config.workers + 2)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| IntakeError::Pool(format!("Failed to create Redis connection pool: {e}")))?;

        let broker = Self::with_pool(pool, &config.queue_name, &config.consumer_name);

        let mut conn = broker.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        tracing::info!(url = %redis_url, queue = %broker.queue, "Connected to Redis task queue");
        Ok(broker)
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: Pool, queue: &str, consumer: &str) -> Self {
        Self {
            pool,
            queue: queue.to_string(),
            processing: format!("{queue}:processing:{consumer}"),
            dead: format!("{queue}:dead"),
            settle: Script::new(SETTLE_SCRIPT),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, IntakeError> {
        self.pool
            .get()
            .await
            .map_err(|e| IntakeError::Pool(e.to_string()))
    }

    async fn settle_into(&self, delivery: &Delivery, target: &str) -> Result<(), IntakeError> {
        let mut conn = self.conn().await?;
        let moved: i64 = self
            .settle
            .key(&self.processing)
            .key(target)
            .arg(&delivery.body)
            .invoke_async(&mut *conn)
            .await?;
        if moved == 0 {
            return Err(IntakeError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for RedisQueueBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, body: &str) -> Result<(), IntakeError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(body)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, IntakeError> {
        let mut conn = self.conn().await?;
        let body: Option<String> = redis::cmd("LMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut *conn)
            .await?;

        // Settlement matches on the body itself
        Ok(body.map(|body| Delivery {
            tag: self.processing.clone(),
            body,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), IntakeError> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(-1)
            .arg(&delivery.body)
            .query_async(&mut *conn)
            .await?;
        if removed == 0 {
            return Err(IntakeError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), IntakeError> {
        if requeue {
            self.settle_into(delivery, &self.queue).await
        } else {
            self.settle_into(delivery, &self.dead).await
        }
    }

    async fn recover(&self) -> Result<usize, IntakeError> {
        let mut conn = self.conn().await?;
        let mut recovered = 0;

        // Newest in-flight first onto the consumer end, so the oldest ends up next
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut *conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(recovered, queue = %self.queue, "Re-queued deliveries left in flight");
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<QueueDepth, IntakeError> {
        let mut conn = self.conn().await?;
        let (ready, in_flight, dead): (usize, usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.queue)
            .cmd("LLEN")
            .arg(&self.processing)
            .cmd("LLEN")
            .arg(&self.dead)
            .query_async(&mut *conn)
            .await?;

        Ok(QueueDepth {
            ready,
            in_flight,
            dead,
        })
    }
}
