//! renew-sync - cross-instance coordination for silent credential renewal
//!
//! This crate keeps any number of instances sharing one logical identity
//! session from renewing credentials over each other, with:
//! - Leader election over a best-effort broadcast channel
//! - A bakery-style mutual exclusion lock over a weak shared store
//!   (no compare-and-swap required, stuck claims self-heal)
//! - A periodic credential check with skip-overlapping-ticks semantics
//! - A bounded-retry renewal orchestrator: the leader performs the
//!   exchange, followers wait for the completion announcement, and both
//!   sides re-decide after a timeout

pub mod bus;
pub mod config;
pub mod credentials;
pub mod flows;
pub mod renew;
pub mod store;
pub mod sync;
#[cfg(test)]
pub mod testutil;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use bus::BroadcastBus;
use config::Config;
use credentials::{CredentialReader, StoredCredentials, TokenPair};
use flows::FlowsData;
use renew::{PeriodicCheckScheduler, RenewError, RenewalOrchestrator, RenewalTransport};
use store::SharedStore;
use sync::{InstanceSync, RenewFinished};

/// One running instance of the session.
///
/// All instances of a group are wired to the same store and bus; each gets
/// its own `Instance`.
pub struct Instance {
    pub config: Config,
    pub flows: Arc<FlowsData>,
    pub orchestrator: Arc<RenewalOrchestrator>,
    pub scheduler: PeriodicCheckScheduler,
    pub store: Arc<dyn SharedStore>,
    pub sync: Arc<InstanceSync>,
}

impl Instance {
    pub fn new(
        config: Config,
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn BroadcastBus>,
        transport: Arc<dyn RenewalTransport>,
    ) -> Self {
        let flows = Arc::new(FlowsData::new(
            Arc::clone(&store),
            config.renew.silent_renew_timeout(),
        ));
        let credentials: Arc<dyn CredentialReader> =
            Arc::new(StoredCredentials::new(Arc::clone(&store)));
        let sync = Arc::new(InstanceSync::new(
            bus,
            &config.instance.client_id,
            config.instance.id.clone(),
            config.election.clone(),
        ));
        let orchestrator = Arc::new(RenewalOrchestrator::new(
            config.renew.clone(),
            Arc::clone(&credentials),
            Arc::clone(&flows),
            Arc::clone(&sync),
            transport,
        ));
        let scheduler = PeriodicCheckScheduler::new(
            config.renew.clone(),
            credentials,
            Arc::clone(&flows),
            Arc::clone(&orchestrator),
            Arc::clone(&store),
        );

        Self {
            config,
            flows,
            orchestrator,
            scheduler,
            store,
            sync,
        }
    }

    /// Start the periodic credential check at the configured interval.
    pub fn start_periodic_check(&self) {
        self.scheduler.start(self.config.renew.check_interval());
    }

    /// Stop the periodic credential check. Idempotent.
    pub fn stop_periodic_check(&self) {
        self.scheduler.stop();
    }

    /// Renew now, or wait for a renewal already underway; see
    /// [`RenewalOrchestrator::force_renew`].
    pub async fn force_renew(
        &self,
        custom_params: Option<HashMap<String, String>>,
    ) -> Result<Option<TokenPair>, RenewError> {
        self.orchestrator.force_renew(custom_params).await
    }

    /// Completion events from this and every other instance.
    pub fn subscribe_renew_finished(&self) -> broadcast::Receiver<RenewFinished> {
        self.sync.subscribe_renew_finished()
    }

    /// Stop the scheduler, release leadership, and close the channels.
    pub async fn close(&self) {
        self.scheduler.stop();
        self.sync.close().await;
    }
}
