//! NATS implementation of the [`Broker`] trait.
//!
//! Queues live on a single JetStream work-queue stream, one filtered durable
//! consumer per queue, which gives per-queue FIFO delivery and late
//! acknowledgement (an unacknowledged message is redelivered after the
//! consumer dies). Control events use plain core NATS fan-out.

use anyhow::{anyhow, Context as _, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::warn;

use super::{Acknowledge, Broker, ControlEvent, Delivery};

const QUEUE_STREAM: &str = "DISPATCH_QUEUES";
const QUEUE_SUBJECT_PREFIX: &str = "dispatch.queue";
const CONTROL_SUBJECT: &str = "dispatch.control";

fn queue_subject(queue: &str) -> String {
    format!("{}.{}", QUEUE_SUBJECT_PREFIX, sanitize(queue))
}

/// Queue names double as subject tokens and durable-consumer names, neither
/// of which may contain separators or wildcards.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | ' ' | '*' | '>' => '_',
            other => other,
        })
        .collect()
}

pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBroker {
    pub fn new(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    async fn queue_stream(&self) -> Result<jetstream::stream::Stream> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: QUEUE_STREAM.to_string(),
                subjects: vec![format!("{}.>", QUEUE_SUBJECT_PREFIX)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow!("failed to create queue stream: {e}"))
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledge for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow!("failed to ack message: {e}"))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<()> {
        self.queue_stream().await?;
        self.jetstream
            .publish(queue_subject(queue), payload)
            .await
            .map_err(|e| anyhow!("failed to publish to {queue}: {e}"))?
            .await
            .map_err(|e| anyhow!("publish to {queue} not acknowledged: {e}"))?;

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Delivery>> {
        let stream = self.queue_stream().await?;
        let durable = sanitize(queue);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: queue_subject(queue),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow!("failed to create consumer for {queue}: {e}"))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| anyhow!("failed to consume {queue}: {e}"))?;

        Ok(messages
            .filter_map(|item| async move {
                match item {
                    Ok(message) => {
                        let payload = message.payload.clone();
                        Some(Delivery::new(payload, Box::new(JetStreamAcker { message })))
                    }
                    Err(e) => {
                        warn!(error = %e, "dropped malformed queue delivery");
                        None
                    }
                }
            })
            .boxed())
    }

    async fn notify(&self, event: ControlEvent) -> Result<()> {
        let payload = serde_json::to_vec(&event).context("failed to encode control event")?;
        self.client
            .publish(CONTROL_SUBJECT.to_string(), payload.into())
            .await
            .map_err(|e| anyhow!("failed to publish control event: {e}"))?;

        Ok(())
    }

    async fn control_events(&self) -> Result<BoxStream<'static, ControlEvent>> {
        let subscriber = self
            .client
            .subscribe(CONTROL_SUBJECT.to_string())
            .await
            .map_err(|e| anyhow!("failed to subscribe to control events: {e}"))?;

        Ok(subscriber
            .filter_map(|message| async move {
                match serde_json::from_slice(&message.payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "dropped malformed control event");
                        None
                    }
                }
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_sanitized() {
        assert_eq!(
            queue_subject("worker1@host1"),
            "dispatch.queue.worker1@host1"
        );
        assert_eq!(queue_subject("bad.name"), "dispatch.queue.bad_name");
        assert_eq!(sanitize("a>b*c d"), "a_b_c_d");
    }
}
