//! # fleet-bus
//!
//! The publish/subscribe transport connecting provisioners and node agents.
//!
//! Delivery is best effort: messages may be lost or duplicated and there is no
//! ordering guarantee across publishers. Callers own every subscription they
//! open and must drop or [`Subscription::unsubscribe`] it when done; a reply
//! that arrives after its subscription is gone is silently discarded.
//!
//! ## Transports
//!
//! - [`MemoryBus`]: in-process fan-out, used by tests and single-process setups
//! - [`NatsBus`]: a NATS connection via `async-nats`

mod error;
mod memory;
mod nats;
mod subscription;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::BusError;
pub use memory::MemoryBus;
pub use nats::NatsBus;
pub use subscription::{Message, Subscription};

/// Publish/subscribe capability shared by provisioners and node agents.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to every current subscriber of `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Publish a payload carrying a reply subject.
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), BusError>;

    /// Subscribe to an exact subject.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Generate a private, unique reply subject.
    fn new_inbox(&self) -> String;

    /// Open a private reply subscription, then publish `payload` to `subject`
    /// with that reply subject attached.
    ///
    /// The returned subscription yields every reply; the caller decides how
    /// many to wait for and for how long.
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Subscription, BusError> {
        let inbox = self.new_inbox();
        let replies = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, &inbox, payload).await?;
        Ok(replies)
    }
}
