//! Periodic credential check driving the orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::config::RenewConfig;
use crate::credentials::CredentialReader;
use crate::flows::FlowsData;
use crate::store::{keys, read_non_empty, SharedStore};

use super::orchestrator::RenewalOrchestrator;

/// Fires a renewal check on a fixed interval.
///
/// Only one check run is ever in flight per scheduler: the tick loop
/// awaits each check, and a tick that fires while one is still pending is
/// dropped, not queued. `stop` is idempotent and safe to call before
/// `start`.
pub struct PeriodicCheckScheduler {
    config: RenewConfig,
    credentials: Arc<dyn CredentialReader>,
    flows: Arc<FlowsData>,
    orchestrator: Arc<RenewalOrchestrator>,
    store: Arc<dyn SharedStore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicCheckScheduler {
    pub fn new(
        config: RenewConfig,
        credentials: Arc<dyn CredentialReader>,
        flows: Arc<FlowsData>,
        orchestrator: Arc<RenewalOrchestrator>,
        store: Arc<dyn SharedStore>,
    ) -> Self {
        Self {
            config,
            credentials,
            flows,
            orchestrator,
            store,
            task: Mutex::new(None),
        }
    }

    /// Start checking every `interval`. No-op when already running or when
    /// silent renew is disabled.
    pub fn start(&self, interval: Duration) {
        if !self.config.silent_renew {
            debug!("Silent renew disabled, periodic check not started");
            return;
        }

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        debug!(interval_seconds = interval.as_secs(), "Starting periodic credential check");

        *task = Some(tokio::spawn(run_checks(
            Arc::clone(&self.credentials),
            Arc::clone(&self.flows),
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.store),
            interval,
        )));
    }

    /// Stop the periodic check, cancelling any pending tick. Safe to call
    /// repeatedly, and before `start`.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            debug!("Periodic credential check stopped");
        }
    }
}

impl Drop for PeriodicCheckScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_checks(
    credentials: Arc<dyn CredentialReader>,
    flows: Arc<FlowsData>,
    orchestrator: Arc<RenewalOrchestrator>,
    store: Arc<dyn SharedStore>,
    interval: Duration,
) {
    // First check after one full interval; overlapping ticks are skipped
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        run_check_once(&credentials, &flows, &orchestrator, &store).await;
    }
}

/// One check run: running claim → expiry → orchestrator, in that order.
async fn run_check_once(
    credentials: &Arc<dyn CredentialReader>,
    flows: &Arc<FlowsData>,
    orchestrator: &Arc<RenewalOrchestrator>,
    store: &Arc<dyn SharedStore>,
) {
    match flows.is_renew_running() {
        Ok(true) => {
            debug!("Renewal already running, skipping check");
            return;
        }
        Ok(false) => {}
        Err(err) => {
            error!(error = %err, "Could not read the renewal claim");
            return;
        }
    }

    match credentials.is_expired() {
        Ok(false) => return,
        Ok(true) => {}
        Err(err) => {
            error!(error = %err, "Could not read credential state");
            return;
        }
    }

    debug!("Credentials expired, starting silent renewal");

    match orchestrator.force_renew(read_custom_params(store)).await {
        Ok(Some(_)) => debug!("Periodic silent renewal finished"),
        Ok(None) => debug!("Periodic check had nothing to do"),
        Err(err) => error!(error = %err, "Periodic silent renewal failed"),
    }
}

/// Caller-provided authorize parameters, persisted by the host under
/// [`keys::CUSTOM_REQUEST_PARAMS`].
fn read_custom_params(store: &Arc<dyn SharedStore>) -> Option<HashMap<String, String>> {
    let raw = read_non_empty(store.as_ref(), keys::CUSTOM_REQUEST_PARAMS).ok()??;
    serde_json::from_str(&raw).ok()
}
