//! Subscriptions and delivered messages.

use bytes::Bytes;
use tokio::sync::mpsc;

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live subscription.
///
/// Dropping it unsubscribes, so a handler that stops listening can never be
/// reached by late messages.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(
        subject: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Message>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next message. Returns `None` once the bus side is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message that has already arrived, without waiting.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Messages already queued are discarded.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}
