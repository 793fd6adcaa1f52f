//! In-memory broker for tests.
//!
//! Provides per-queue FIFO channels and a broadcast control channel, and
//! records every publish so tests can inspect traffic without a real bus.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};

use super::{Acknowledge, Broker, ControlEvent, Delivery};

/// A message recorded by [`TestBroker`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Bytes,
}

struct QueueChannel {
    tx: UnboundedSender<Bytes>,
    rx: Option<UnboundedReceiver<Bytes>>,
}

impl QueueChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// In-memory [`Broker`] with per-queue FIFO ordering.
pub struct TestBroker {
    queues: Mutex<HashMap<String, QueueChannel>>,
    published: RwLock<Vec<PublishedMessage>>,
    notified: RwLock<Vec<ControlEvent>>,
    control_tx: broadcast::Sender<ControlEvent>,
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBroker {
    pub fn new() -> Self {
        let (control_tx, _) = broadcast::channel(64);
        Self {
            queues: Mutex::new(HashMap::new()),
            published: RwLock::new(Vec::new()),
            notified: RwLock::new(Vec::new()),
            control_tx,
        }
    }

    /// All messages published so far.
    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Messages published to one queue, in order.
    pub fn messages_for_queue(&self, queue: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    /// Whether anything was published to a queue.
    pub fn was_published_to(&self, queue: &str) -> bool {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|m| m.queue == queue)
    }

    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// All control events notified so far.
    pub fn notified_events(&self) -> Vec<ControlEvent> {
        self.notified
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct NoopAcker;

#[async_trait]
impl Acknowledge for NoopAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Broker for TestBroker {
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<()> {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                queue: queue.to_string(),
                payload: payload.clone(),
            });

        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let channel = queues
            .entry(queue.to_string())
            .or_insert_with(QueueChannel::new);
        // A closed receiver just means nobody is consuming yet in this test.
        let _ = channel.tx.send(payload);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Delivery>> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let channel = queues
            .entry(queue.to_string())
            .or_insert_with(QueueChannel::new);
        let rx = channel
            .rx
            .take()
            .ok_or_else(|| anyhow!("queue {queue} already has a consumer"))?;

        Ok(UnboundedReceiverStream::new(rx)
            .map(|payload| Delivery::new(payload, Box::new(NoopAcker)))
            .boxed())
    }

    async fn notify(&self, event: ControlEvent) -> Result<()> {
        self.notified
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        // No subscribers is fine.
        let _ = self.control_tx.send(event);
        Ok(())
    }

    async fn control_events(&self) -> Result<BoxStream<'static, ControlEvent>> {
        let rx = self.control_tx.subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }
}
