//! Cross-instance synchronization: who leads, and who has finished.
//!
//! Couples the leader elector with the renewal-completion channel. The
//! completion signal fans out two ways: remotely over the bus to every
//! other instance, and locally through a broadcast channel so waiters in
//! this instance (and external subscribers) see completions from anyone.

pub mod election;

pub use election::{ElectionError, LeaderElector};

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{BroadcastBus, BusHandle};
use crate::config::ElectionConfig;

/// Local fan-out capacity for completion events
const FINISHED_CAPACITY: usize = 16;

/// A renewal finished somewhere in the instance group.
#[derive(Debug, Clone)]
pub struct RenewFinished {
    /// Instance that performed the renewal
    pub completed_by: String,
}

pub struct InstanceSync {
    elector: LeaderElector,
    finished_handle: Option<BusHandle>,
    finished_tx: broadcast::Sender<RenewFinished>,
    instance_id: String,
    listener: Option<JoinHandle<()>>,
}

impl InstanceSync {
    /// Open the leadership and completion channels for the group named by
    /// `prefix` (the client id — all instances of one logical session use
    /// the same prefix).
    pub fn new(
        bus: Arc<dyn BroadcastBus>,
        prefix: &str,
        instance_id: String,
        config: ElectionConfig,
    ) -> Self {
        let elector = LeaderElector::new(
            Arc::clone(&bus),
            format!("{prefix}_leader"),
            instance_id.clone(),
            config,
        );

        let (finished_tx, _) = broadcast::channel(FINISHED_CAPACITY);

        let finished_channel = format!("{prefix}_renew_finished");
        let (finished_handle, listener) = match bus.open(&finished_channel) {
            Ok(handle) => {
                let listener = spawn_finished_listener(&handle, finished_tx.clone());
                (Some(handle), Some(listener))
            }
            Err(_) => {
                warn!(channel = %finished_channel, "Completion channel unavailable, remote completions will not be seen");
                (None, None)
            }
        };

        Self {
            elector,
            finished_handle,
            finished_tx,
            instance_id,
            listener,
        }
    }

    /// Current leadership snapshot; see [`LeaderElector::is_leader`].
    pub async fn is_leader(&self) -> Result<bool, ElectionError> {
        self.elector.is_leader().await
    }

    /// Announce that this instance completed a renewal, to local waiters
    /// and to every other instance on the bus.
    pub fn notify_renew_finished(&self) {
        let event = RenewFinished {
            completed_by: self.instance_id.clone(),
        };

        // No local waiters is fine
        let _ = self.finished_tx.send(event);

        if let Some(handle) = &self.finished_handle {
            if handle.post(&self.instance_id).is_err() {
                debug!("Completion channel closed, remote instances not notified");
            }
        }
    }

    /// A fresh subscription seeing only completions that happen after this
    /// call — deliberately no replay of earlier ones.
    pub fn subscribe_renew_finished(&self) -> broadcast::Receiver<RenewFinished> {
        self.finished_tx.subscribe()
    }

    /// Release leadership and stop listening. Safe to call more than once.
    pub async fn close(&self) {
        self.elector.close().await;

        if let Some(listener) = &self.listener {
            listener.abort();
        }
        if let Some(handle) = &self.finished_handle {
            handle.close();
        }
    }
}

/// Forward completion messages from the bus into the local fan-out.
fn spawn_finished_listener(
    handle: &BusHandle,
    finished_tx: broadcast::Sender<RenewFinished>,
) -> JoinHandle<()> {
    let mut sub = handle.subscribe();

    tokio::spawn(async move {
        while let Some(completed_by) = sub.recv().await {
            debug!(completed_by = %completed_by, "Renewal finished elsewhere");
            let _ = finished_tx.send(RenewFinished { completed_by });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::LocalBus;

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            fallback_interval_ms: 200,
            response_time_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_completion_fans_out_to_other_instances() {
        let bus = Arc::new(LocalBus::new()) as Arc<dyn BroadcastBus>;
        let a = InstanceSync::new(Arc::clone(&bus), "grp", "a".to_string(), fast_config());
        let b = InstanceSync::new(Arc::clone(&bus), "grp", "b".to_string(), fast_config());

        let mut b_events = b.subscribe_renew_finished();
        a.notify_renew_finished();

        let event = b_events.recv().await.unwrap();
        assert_eq!(event.completed_by, "a");

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_completion_reaches_local_waiters_too() {
        let bus = Arc::new(LocalBus::new()) as Arc<dyn BroadcastBus>;
        let a = InstanceSync::new(Arc::clone(&bus), "grp", "a".to_string(), fast_config());

        let mut events = a.subscribe_renew_finished();
        a.notify_renew_finished();

        let event = events.recv().await.unwrap();
        assert_eq!(event.completed_by, "a");

        a.close().await;
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = Arc::new(LocalBus::new()) as Arc<dyn BroadcastBus>;
        let a = InstanceSync::new(Arc::clone(&bus), "grp", "a".to_string(), fast_config());

        a.notify_renew_finished();
        let mut late = a.subscribe_renew_finished();

        let got = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            late.recv(),
        )
        .await;
        assert!(got.is_err());

        a.close().await;
    }
}
