//! Intake workers

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Delivery, IntakeError, MessageBroker, TaskMessage};
use crate::config::IntakeConfig;
use crate::error::ClassifiedError;
use crate::metrics;
use crate::scheduler::{ScheduleStatus, Scheduler};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Dispatched, duplicate or definitively rejected
    Acked,
    /// Transient rejection, back on the queue
    Requeued,
    /// Malformed body
    DeadLettered,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Pulls task messages and feeds them to the scheduler
pub struct IntakeService {
    broker: Arc<dyn MessageBroker>,
    scheduler: Arc<Scheduler>,
    workers: usize,
    poll_interval: Duration,
    requeue_delay: Duration,
}

impl IntakeService {
    pub fn new(broker: Arc<dyn MessageBroker>, scheduler: Arc<Scheduler>, config: &IntakeConfig) -> Self {
        Self {
            broker,
            scheduler,
            workers: config.workers.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            requeue_delay: Duration::from_millis(config.requeue_delay_ms),
        }
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    /// Schedule one delivery and settle it
    pub async fn process(&self, delivery: &Delivery) -> Result<Disposition, IntakeError> {
        let message = match TaskMessage::parse(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dead-lettering malformed task message");
                self.broker.reject(delivery, false).await?;
                return Ok(self.settled(Disposition::DeadLettered));
            }
        };

        let task_id = message.task_id.clone();
        match self.scheduler.schedule(message.into_request()).await {
            Ok(response) => {
                if response.status == ScheduleStatus::Duplicate {
                    debug!(task_id = %task_id, "Redelivered task already scheduled");
                }
                self.broker.ack(delivery).await?;
                Ok(self.settled(Disposition::Acked))
            }
            Err(e) if e.kind().is_transient() => {
                info!(task_id = %task_id, kind = %e.kind(), "Task deferred, requeueing");
                tokio::time::sleep(self.requeue_delay).await;
                self.broker.reject(delivery, true).await?;
                Ok(self.settled(Disposition::Requeued))
            }
            Err(e) => {
                warn!(task_id = %task_id, kind = %e.kind(), error = %e, "Task rejected");
                self.broker.ack(delivery).await?;
                Ok(self.settled(Disposition::Acked))
            }
        }
    }

    fn settled(&self, disposition: Disposition) -> Disposition {
        metrics::record_intake_message(disposition.as_str());
        disposition
    }

    /// Re-queue leftovers from a previous run, then start the workers
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>, IntakeError> {
        self.broker.recover().await?;
        info!(workers = self.workers, broker = self.broker.name(), "Starting intake workers");

        Ok((0..self.workers)
            .map(|worker| {
                let service = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { service.run_worker(worker, shutdown).await })
            })
            .collect())
    }

    async fn run_worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.broker.receive().await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(&delivery).await {
                        error!(worker, error = %e, "Failed to settle delivery");
                    }
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(worker, error = %e, "Queue receive failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!(worker, "Intake worker stopped");
    }
}
