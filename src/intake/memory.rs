//! In-process message broker for tests and local runs

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;

use super::{Delivery, IntakeError, MessageBroker, QueueDepth};

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<String>,
    in_flight: BTreeMap<u64, String>,
    dead: Vec<String>,
    seq: u64,
}

/// Queue held in memory; nothing survives a restart
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies that were dead-lettered, oldest first
    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead.clone()
    }

    fn parse_tag(tag: &str) -> Result<u64, IntakeError> {
        tag.parse()
            .map_err(|_| IntakeError::UnknownDelivery(tag.to_string()))
    }

    fn take(state: &mut BrokerState, delivery: &Delivery) -> Result<String, IntakeError> {
        let seq = Self::parse_tag(&delivery.tag)?;
        state
            .in_flight
            .remove(&seq)
            .ok_or_else(|| IntakeError::UnknownDelivery(delivery.tag.clone()))
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, body: &str) -> Result<(), IntakeError> {
        self.state.lock().await.ready.push_back(body.to_string());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, IntakeError> {
        let mut state = self.state.lock().await;
        let Some(body) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.seq += 1;
        let seq = state.seq;
        state.in_flight.insert(seq, body.clone());
        Ok(Some(Delivery {
            tag: seq.to_string(),
            body,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), IntakeError> {
        let mut state = self.state.lock().await;
        Self::take(&mut state, delivery)?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), IntakeError> {
        let mut state = self.state.lock().await;
        let body = Self::take(&mut state, delivery)?;
        if requeue {
            state.ready.push_back(body);
        } else {
            state.dead.push(body);
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize, IntakeError> {
        let mut state = self.state.lock().await;
        let in_flight = std::mem::take(&mut state.in_flight);
        let count = in_flight.len();
        // Oldest in-flight message is consumed first
        for body in in_flight.into_values().rev() {
            state.ready.push_front(body);
        }
        Ok(count)
    }

    async fn depth(&self) -> Result<QueueDepth, IntakeError> {
        let state = self.state.lock().await;
        Ok(QueueDepth {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead: state.dead.len(),
        })
    }
}
