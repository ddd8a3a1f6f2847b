//! Leader election over the broadcast bus.
//!
//! One channel per instance group carries three message kinds: an `Apply`
//! announces a candidacy, a `Claim` asserts current leadership, a `Resign`
//! gives it up. A candidate applies, listens for a response window, and
//! self-promotes on silence; a live leader answers every `Apply` with a
//! `Claim`, which doubles as the liveness probe. Followers re-apply on a
//! fallback interval and immediately after a `Resign`, so a vanished
//! leader is replaced within one interval and a closing one is replaced
//! right away.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::bus::{BroadcastBus, BusHandle, BusSubscription};
use crate::config::ElectionConfig;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("Leadership channel unavailable")]
    ChannelUnavailable,
}

/// Where this instance stands in the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectorStatus {
    Electing,
    Settled { is_leader: bool },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ElectionMessage {
    Apply { id: String, priority: u64 },
    Claim { id: String, priority: u64 },
    Resign { id: String },
}

/// This instance's candidacy: random priority, unique id. Lower
/// `(priority, id)` outranks — any well-distributed total order works,
/// it only has to be the same order on every instance.
#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    priority: u64,
}

impl Candidate {
    fn outranked_by(&self, priority: u64, id: &str) -> bool {
        (priority, id) < (self.priority, self.id.as_str())
    }
}

/// Designates at most one leader among the instances sharing a channel.
///
/// `Uninitialized → Electing → Settled(leader | follower)`; `is_leader()`
/// suspends until the first round settles. `close()` resigns leadership
/// deterministically; `re_initialize()` is only valid after `close()`.
pub struct LeaderElector {
    bus: Arc<dyn BroadcastBus>,
    channel_name: String,
    config: ElectionConfig,
    instance_id: String,
    running: Mutex<Option<Running>>,
}

struct Running {
    handle: BusHandle,
    shutdown_tx: mpsc::Sender<()>,
    status_rx: watch::Receiver<ElectorStatus>,
    task: JoinHandle<()>,
}

impl LeaderElector {
    /// Open the leadership channel and start the first negotiation round.
    ///
    /// An unavailable bus is not a constructor error: the elector comes up
    /// in a degraded state where every [`is_leader`](Self::is_leader) call
    /// reports [`ElectionError::ChannelUnavailable`].
    pub fn new(
        bus: Arc<dyn BroadcastBus>,
        channel_name: String,
        instance_id: String,
        config: ElectionConfig,
    ) -> Self {
        let running = match start(bus.as_ref(), &channel_name, &instance_id, &config) {
            Ok(running) => Some(running),
            Err(_) => {
                warn!(channel = %channel_name, "Leadership channel unavailable, degrading to follower-only");
                None
            }
        };

        Self {
            bus,
            channel_name,
            config,
            instance_id,
            running: Mutex::new(running),
        }
    }

    /// Current leadership snapshot.
    ///
    /// Suspends until the first negotiation round completes when called
    /// before `Settled`, bounded by the negotiation timeout; afterwards
    /// returns immediately.
    pub async fn is_leader(&self) -> Result<bool, ElectionError> {
        let mut status_rx = {
            let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            match running.as_ref() {
                Some(running) => running.status_rx.clone(),
                None => return Err(ElectionError::ChannelUnavailable),
            }
        };

        if let ElectorStatus::Settled { is_leader } = *status_rx.borrow() {
            return Ok(is_leader);
        }

        let negotiation_timeout = 2 * self.config.response_time();
        let settled = tokio::time::timeout(
            negotiation_timeout,
            status_rx.wait_for(|status| matches!(status, ElectorStatus::Settled { .. })),
        )
        .await;

        match settled {
            Ok(Ok(status)) => match *status {
                ElectorStatus::Settled { is_leader } => Ok(is_leader),
                ElectorStatus::Electing => Ok(false),
            },
            // Elector task gone mid-wait
            Ok(Err(_)) => Err(ElectionError::ChannelUnavailable),
            Err(_) => {
                warn!("Negotiation did not settle within the timeout, answering as follower");
                Ok(false)
            }
        }
    }

    /// Tear down the channel subscription and release leadership, posting
    /// a resignation so the group is not leaderless for a full liveness
    /// interval. Safe to call more than once.
    pub async fn close(&self) {
        let running = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.take()
        };

        if let Some(running) = running {
            let _ = running.shutdown_tx.send(()).await;
            let _ = running.task.await;
            running.handle.close();
            debug!(instance = %self.instance_id, "Elector closed");
        }
    }

    /// Restart negotiation after a [`close`](Self::close).
    ///
    /// # Panics
    ///
    /// Panics when the elector is still running — calling this before
    /// `close()` is a programming error, not a condition to recover from.
    pub fn re_initialize(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        assert!(
            running.is_none(),
            "re_initialize() called on an elector that was not closed"
        );

        match start(
            self.bus.as_ref(),
            &self.channel_name,
            &self.instance_id,
            &self.config,
        ) {
            Ok(restarted) => *running = Some(restarted),
            Err(_) => {
                warn!(channel = %self.channel_name, "Leadership channel unavailable on re-initialize");
            }
        }
    }
}

fn start(
    bus: &dyn BroadcastBus,
    channel_name: &str,
    instance_id: &str,
    config: &ElectionConfig,
) -> Result<Running, ElectionError> {
    let handle = bus
        .open(channel_name)
        .map_err(|_| ElectionError::ChannelUnavailable)?;
    let sub = handle.subscribe();

    let (status_tx, status_rx) = watch::channel(ElectorStatus::Electing);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let me = Candidate {
        id: instance_id.to_string(),
        priority: rand::thread_rng().gen(),
    };

    let task = tokio::spawn(
        ElectorTask {
            fallback_interval: config.fallback_interval(),
            handle: Arc::clone(&handle),
            me,
            response_time: config.response_time(),
            shutdown: shutdown_rx,
            status_tx,
            sub,
        }
        .run(),
    );

    Ok(Running {
        handle,
        shutdown_tx,
        status_rx,
        task,
    })
}

enum RoundOutcome {
    Lost,
    Shutdown,
    Won,
}

enum Action {
    None,
    ReApply,
    StepDown,
}

struct ElectorTask {
    fallback_interval: Duration,
    handle: BusHandle,
    me: Candidate,
    response_time: Duration,
    shutdown: mpsc::Receiver<()>,
    status_tx: watch::Sender<ElectorStatus>,
    sub: BusSubscription,
}

impl ElectorTask {
    async fn run(mut self) {
        let mut is_leader = match self.apply_round().await {
            RoundOutcome::Shutdown => return,
            RoundOutcome::Won => true,
            RoundOutcome::Lost => false,
        };
        self.settle(is_leader);

        let mut fallback = interval_at(
            Instant::now() + self.fallback_interval,
            self.fallback_interval,
        );
        fallback.set_missed_tick_behavior(MissedTickBehavior::Skip);

        enum Wake {
            Message(Option<String>),
            Retry,
            Shutdown,
        }

        loop {
            let wake = {
                let Self { shutdown, sub, .. } = &mut self;
                tokio::select! {
                    _ = shutdown.recv() => Wake::Shutdown,
                    message = sub.recv() => Wake::Message(message),
                    _ = fallback.tick(), if !is_leader => Wake::Retry,
                }
            };

            match wake {
                Wake::Shutdown => {
                    if is_leader {
                        let _ = self.post(&ElectionMessage::Resign {
                            id: self.me.id.clone(),
                        });
                    }
                    return;
                }
                // Bus torn down underneath us
                Wake::Message(None) => return,
                Wake::Message(Some(raw)) => match self.handle_message(&raw, is_leader) {
                    Action::None => {}
                    Action::StepDown => {
                        debug!(instance = %self.me.id, "Outranked by another leader, stepping down");
                        is_leader = false;
                        self.settle(false);
                    }
                    Action::ReApply => {
                        if let RoundOutcome::Shutdown = self.reapply(&mut is_leader).await {
                            return;
                        }
                    }
                },
                Wake::Retry => {
                    if let RoundOutcome::Shutdown = self.reapply(&mut is_leader).await {
                        return;
                    }
                }
            }
        }
    }

    async fn reapply(&mut self, is_leader: &mut bool) -> RoundOutcome {
        let outcome = self.apply_round().await;
        if let RoundOutcome::Won = outcome {
            debug!(instance = %self.me.id, "Promoted to leader");
            *is_leader = true;
            self.settle(true);
        }
        outcome
    }

    /// One candidacy round: announce, listen for objections for the
    /// response window, self-promote on silence.
    async fn apply_round(&mut self) -> RoundOutcome {
        let apply = ElectionMessage::Apply {
            id: self.me.id.clone(),
            priority: self.me.priority,
        };
        if self.post(&apply).is_err() {
            return RoundOutcome::Lost;
        }

        let deadline = Instant::now() + self.response_time;
        let Self {
            handle,
            me,
            shutdown,
            sub,
            ..
        } = self;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let claim = ElectionMessage::Claim {
                        id: me.id.clone(),
                        priority: me.priority,
                    };
                    let _ = post_on(handle, &claim);
                    return RoundOutcome::Won;
                }
                _ = shutdown.recv() => return RoundOutcome::Shutdown,
                message = sub.recv() => {
                    let Some(raw) = message else { return RoundOutcome::Lost };
                    if objection(me, &raw) {
                        return RoundOutcome::Lost;
                    }
                }
            }
        }
    }

    fn handle_message(&self, raw: &str, is_leader: bool) -> Action {
        let Ok(message) = serde_json::from_str::<ElectionMessage>(raw) else {
            return Action::None;
        };

        match message {
            // A live leader answers every candidacy; that answer is the
            // liveness probe followers key off.
            ElectionMessage::Apply { .. } if is_leader => {
                let _ = self.post(&ElectionMessage::Claim {
                    id: self.me.id.clone(),
                    priority: self.me.priority,
                });
                Action::None
            }
            ElectionMessage::Apply { .. } => Action::None,
            // Two leaders can only happen after lost messages; the ranking
            // rule collapses them back to one.
            ElectionMessage::Claim { id, priority } if is_leader && id != self.me.id => {
                if self.me.outranked_by(priority, &id) {
                    Action::StepDown
                } else {
                    let _ = self.post(&ElectionMessage::Claim {
                        id: self.me.id.clone(),
                        priority: self.me.priority,
                    });
                    Action::None
                }
            }
            ElectionMessage::Claim { .. } => Action::None,
            ElectionMessage::Resign { .. } if !is_leader => Action::ReApply,
            ElectionMessage::Resign { .. } => Action::None,
        }
    }

    fn settle(&self, is_leader: bool) {
        self.status_tx
            .send_replace(ElectorStatus::Settled { is_leader });
    }

    fn post(&self, message: &ElectionMessage) -> Result<(), crate::bus::BusError> {
        post_on(&self.handle, message)
    }
}

fn post_on(handle: &BusHandle, message: &ElectionMessage) -> Result<(), crate::bus::BusError> {
    match serde_json::to_string(message) {
        Ok(payload) => handle.post(&payload),
        Err(_) => Ok(()),
    }
}

/// Whether a message received mid-candidacy defeats this round.
fn objection(me: &Candidate, raw: &str) -> bool {
    match serde_json::from_str::<ElectionMessage>(raw) {
        Ok(ElectionMessage::Claim { id, .. }) => id != me.id,
        Ok(ElectionMessage::Apply { id, priority }) => me.outranked_by(priority, &id),
        // A resignation mid-round only improves our odds
        Ok(ElectionMessage::Resign { .. }) => false,
        Err(_) => false,
    }
}
