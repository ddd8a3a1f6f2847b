use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use super::{BroadcastBus, BusChannel, BusError, BusHandle, BusReceiver, BusSubscription};

/// Per-channel fan-out capacity. A subscriber that lags past this many
/// messages silently loses the overflow, which the bus contract allows.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Envelope {
    payload: String,
    sender: u64,
}

/// In-process broadcast bus.
///
/// All instances in one process open channels by name on a shared
/// `LocalBus`; messages fan out to every handle on the same name except
/// the one that posted, matching the no-self-delivery semantics the
/// election protocol depends on.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    next_handle_id: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BroadcastBus for LocalBus {
    fn open(&self, channel: &str) -> Result<BusHandle, BusError> {
        let tx = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };

        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        trace!(channel = %channel, handle = id, "Opened local bus channel");

        Ok(Arc::new(LocalChannel {
            closed: AtomicBool::new(false),
            id,
            tx,
        }))
    }
}

struct LocalChannel {
    closed: AtomicBool,
    id: u64,
    tx: broadcast::Sender<Envelope>,
}

impl BusChannel for LocalChannel {
    fn post(&self, payload: &str) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        // No listeners is fine — fire and forget
        let _ = self.tx.send(Envelope {
            payload: payload.to_string(),
            sender: self.id,
        });
        Ok(())
    }

    fn subscribe(&self) -> BusSubscription {
        BusSubscription::new(Box::new(LocalReceiver {
            rx: self.tx.subscribe(),
            self_id: self.id,
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct LocalReceiver {
    rx: broadcast::Receiver<Envelope>,
    self_id: u64,
}

#[async_trait]
impl BusReceiver for LocalReceiver {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.sender == self.self_id => continue,
                Ok(envelope) => return Some(envelope.payload),
                // Lagging loses messages, it does not end the stream
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_to_other_handles() {
        let bus = LocalBus::new();
        let a = bus.open("ch").unwrap();
        let b = bus.open("ch").unwrap();

        let mut sub = b.subscribe();
        a.post("hello").unwrap();

        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_does_not_deliver_to_self() {
        let bus = LocalBus::new();
        let a = bus.open("ch").unwrap();
        let b = bus.open("ch").unwrap();

        let mut own = a.subscribe();
        let mut other = b.subscribe();
        a.post("only-for-others").unwrap();
        a.post("second").unwrap();

        // b sees both posts; a's own subscription sees neither
        assert_eq!(other.recv().await.as_deref(), Some("only-for-others"));
        assert_eq!(other.recv().await.as_deref(), Some("second"));

        b.post("from-b").unwrap();
        assert_eq!(own.recv().await.as_deref(), Some("from-b"));
    }

    #[tokio::test]
    async fn test_channels_are_isolated_by_name() {
        let bus = LocalBus::new();
        let a = bus.open("one").unwrap();
        let b = bus.open("two").unwrap();

        let mut sub = b.subscribe();
        a.post("wrong channel").unwrap();
        b.close();

        // Closing b stops posts but the only way sub ends is sender drop;
        // assert nothing arrived by racing against a short timeout.
        let got = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sub.recv(),
        )
        .await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_posting() {
        let bus = LocalBus::new();
        let a = bus.open("ch").unwrap();

        a.close();
        a.close();
        assert!(matches!(a.post("nope"), Err(BusError::Closed)));
    }
}
