//! Broker abstraction: named FIFO queues plus a control channel.
//!
//! The dispatch layer needs four capabilities from a broker: publish to a
//! named queue, consume a queue as a FIFO stream with late acknowledgement
//! (so that worker death re-delivers unacknowledged work), fan out control
//! events (revocations, release notices), and nothing else. The trait keeps
//! the core independent of the concrete bus; [`nats::NatsBroker`] is the
//! production implementation and [`testing::TestBroker`] the in-process one.

pub mod nats;
pub mod testing;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use nats::NatsBroker;
pub use testing::TestBroker;

/// Events fanned out to every connected process, outside the FIFO queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Ask whichever worker is running the task to terminate it.
    Revoke { task_id: Uuid },
    /// A task's reservations were just released; placement may proceed.
    Released { task_id: Uuid },
}

/// A message taken from a queue, not yet acknowledged.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves it
/// outstanding; a broker with redelivery will hand it to the next consumer.
pub struct Delivery {
    pub payload: Bytes,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(payload: Bytes, acker: Box<dyn Acknowledge>) -> Self {
        Self { payload, acker }
    }

    /// Acknowledge the message after processing.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// The message bus contract required by the dispatch core.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload onto a named queue.
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<()>;

    /// Consume a named queue as an in-order stream of deliveries.
    ///
    /// Each queue has a single consumer at a time (the worker it is named
    /// after, or the active resource manager).
    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Delivery>>;

    /// Fan a control event out to every connected process.
    async fn notify(&self, event: ControlEvent) -> Result<()>;

    /// Subscribe to the control fan-out.
    async fn control_events(&self) -> Result<BoxStream<'static, ControlEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_events_round_trip() {
        let events = [
            ControlEvent::Revoke {
                task_id: Uuid::new_v4(),
            },
            ControlEvent::Released {
                task_id: Uuid::new_v4(),
            },
        ];
        for event in events {
            let json = serde_json::to_vec(&event).unwrap();
            let back: ControlEvent = serde_json::from_slice(&json).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn control_event_is_tagged() {
        let event = ControlEvent::Revoke {
            task_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"revoke""#));
    }
}
