//! NATS transport.

use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{Bus, BusError, Message, Subscription};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Bus backed by a NATS connection.
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Connect to a NATS server. Fails fast if the server is unreachable;
    /// reconnection after a successful connect is handled by the client.
    pub async fn connect(url: &str, name: &str) -> Result<Self, BusError> {
        info!(url = %url, "Connecting to NATS");

        let client = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        info!(url = %url, "Connected to NATS");
        Ok(Self { client })
    }

    /// Get the underlying NATS client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let owned_subject = subject.to_string();

        // Dropping the NATS subscriber (when this task is aborted) sends UNSUB.
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let message = Message {
                    subject: msg.subject.as_str().to_string(),
                    reply: msg.reply.map(|r| r.as_str().to_string()),
                    payload: msg.payload,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            debug!(subject = %owned_subject, "NATS subscription ended");
        });

        Ok(Subscription::new(subject, rx, move || forwarder.abort()))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }
}
