//! In-process bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Bus, BusError, Message, Subscription};

struct Subscriber {
    subject: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }
}

/// Bus that fans messages out to subscribers inside this process.
///
/// Cheap to clone; clones share the same subscriber table. Subjects match
/// exactly, there are no wildcards.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subs| subs.values().filter(|s| s.subject == subject).count())
            .unwrap_or(0)
    }

    fn deliver(&self, message: Message) -> Result<(), BusError> {
        let subscribers = self.inner.subscribers.lock().map_err(|_| BusError::Closed)?;

        let mut delivered = 0usize;
        for subscriber in subscribers.values() {
            if subscriber.subject == message.subject && subscriber.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        trace!(subject = %message.subject, delivered, "Delivered message");
        Ok(())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.deliver(Message {
            subject: subject.to_string(),
            reply: None,
            payload,
        })
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.deliver(Message {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .subscribers
            .lock()
            .map_err(|_| BusError::Subscribe {
                subject: subject.to_string(),
                message: "subscriber table poisoned".to_string(),
            })?
            .insert(
                id,
                Subscriber {
                    subject: subject.to_string(),
                    tx,
                },
            );

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(subject, rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(id);
            }
        }))
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", ulid::Ulid::new())
    }
}
