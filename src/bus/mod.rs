//! Best-effort broadcast messaging between instances.
//!
//! Delivery is unordered, at-most-once per listener, and never echoed back
//! to the posting handle. A message may be lost entirely — every consumer
//! in this crate pairs a bus wait with a timeout for exactly that reason.

pub mod local;

pub use local::LocalBus;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Channel handle already closed")]
    Closed,
    #[error("Broadcast channel unavailable")]
    Unavailable,
}

/// Handle to one named channel, shared by post and subscribe sides.
pub type BusHandle = Arc<dyn BusChannel>;

/// Opens named channels on the underlying fan-out medium.
pub trait BroadcastBus: Send + Sync {
    fn open(&self, channel: &str) -> Result<BusHandle, BusError>;
}

/// One open channel.
///
/// `close` is idempotent; posting on a closed handle fails with
/// [`BusError::Closed`]. Subscriptions created before the close keep
/// draining whatever was already in flight.
pub trait BusChannel: Send + Sync {
    /// Fire-and-forget send to every other listener on this channel.
    fn post(&self, payload: &str) -> Result<(), BusError>;

    /// A fresh single-consumer queue of future messages from other handles.
    fn subscribe(&self) -> BusSubscription;

    /// Stop this handle from posting. Safe to call more than once.
    fn close(&self);
}

/// Implementation-side receive end of one subscription.
#[async_trait]
pub trait BusReceiver: Send {
    async fn recv(&mut self) -> Option<String>;
}

/// Single-consumer stream of messages from the other handles on a channel.
///
/// Dropping the subscription unsubscribes.
pub struct BusSubscription {
    inner: Box<dyn BusReceiver>,
}

impl BusSubscription {
    pub fn new(inner: Box<dyn BusReceiver>) -> Self {
        Self { inner }
    }

    /// Next message, or `None` once the channel can produce no more.
    pub async fn recv(&mut self) -> Option<String> {
        self.inner.recv().await
    }
}
