use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::store::records::{AuthStateControlRecord, FlowKind, RenewalLockRecord, RenewalState};
use crate::store::{keys, read_non_empty, SharedStore, StoreError};

use super::lock::MutualExclusionLock;

/// Length of the correlation-state nonce (hex characters)
const STATE_NONCE_LEN: usize = 40;

/// Owns the flow-state records every instance consults before and during a
/// renewal: the Running claim and the correlation state.
///
/// One configured timeout governs both staleness rules — the same value
/// bounds the renewal wait, so a record that outlives it belongs to an
/// attempt that has already been given up on.
pub struct FlowsData {
    lock: MutualExclusionLock,
    renew_timeout: Duration,
    store: Arc<dyn SharedStore>,
}

impl FlowsData {
    pub fn new(store: Arc<dyn SharedStore>, renew_timeout: Duration) -> Self {
        let lock = MutualExclusionLock::new(
            Arc::clone(&store),
            keys::RENEW_LOCK_X,
            keys::RENEW_LOCK_Y,
            renew_timeout,
        );
        Self {
            lock,
            renew_timeout,
            store,
        }
    }

    // ========================================================================
    // Renewal claim
    // ========================================================================

    /// Whether a renewal is currently marked Running.
    ///
    /// A Running record older than the timeout is presumed abandoned: this
    /// reader writes the reset and reports not-running.
    pub fn is_renew_running(&self) -> Result<bool, StoreError> {
        let Some(raw) = read_non_empty(self.store.as_ref(), keys::RENEWAL_RUNNING)? else {
            return Ok(false);
        };

        let record: RenewalLockRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(_) => {
                debug!("Unreadable renewal record, resetting");
                self.reset_renew_running()?;
                return Ok(false);
            }
        };

        if record.is_stuck(self.renew_timeout) {
            debug!("Renewal record is probably stuck, resetting");
            self.reset_renew_running()?;
            return Ok(false);
        }

        Ok(record.state == RenewalState::Running)
    }

    /// Transition the renewal claim Idle → Running through the mutex.
    ///
    /// Returns `true` only when this instance performed the transition;
    /// `false` when another instance holds or already made it.
    pub async fn claim_renew_running(&self, flow: FlowKind) -> Result<bool, StoreError> {
        self.lock
            .try_acquire(
                || self.is_renew_running(),
                || {
                    let record = RenewalLockRecord::running(flow);
                    self.store
                        .write(keys::RENEWAL_RUNNING, &serde_json::to_string(&record)?)
                },
            )
            .await
    }

    /// Clear the renewal claim back to Idle.
    pub fn reset_renew_running(&self) -> Result<(), StoreError> {
        self.store.write(keys::RENEWAL_RUNNING, "")
    }

    // ========================================================================
    // Correlation state
    // ========================================================================

    /// Store a fresh correlation state for an outbound authorization
    /// request, overwriting any previous one. Returns the nonce.
    pub fn create_auth_state_control(&self, flow: FlowKind) -> Result<String, StoreError> {
        let state = random_state();
        let record = AuthStateControlRecord::new(state.clone(), flow);
        self.store
            .write(keys::AUTH_STATE_CONTROL, &serde_json::to_string(&record)?)?;
        debug!(launched_from = ?flow, "Created auth state control");
        Ok(state)
    }

    /// Reuse the pending correlation state for this flow if one exists,
    /// otherwise create one.
    pub fn existing_or_create_auth_state_control(
        &self,
        flow: FlowKind,
    ) -> Result<String, StoreError> {
        match self.read_auth_state_control(flow)? {
            Some(state) => Ok(state),
            None => self.create_auth_state_control(flow),
        }
    }

    /// The stored correlation state, if it was launched from the expected
    /// flow and has not gone stale. A silent-renew record older than the
    /// renewal timeout is discarded rather than matched.
    pub fn read_auth_state_control(
        &self,
        expected_flow: FlowKind,
    ) -> Result<Option<String>, StoreError> {
        let Some(raw) = read_non_empty(self.store.as_ref(), keys::AUTH_STATE_CONTROL)? else {
            return Ok(None);
        };

        let record: AuthStateControlRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(_) => return Ok(None),
        };

        if record.launched_from != expected_flow {
            return Ok(None);
        }
        if record.is_stale(self.renew_timeout) {
            debug!("Auth state control went stale, treating as absent");
            return Ok(None);
        }

        Ok(Some(record.state))
    }
}

/// 40-hex-char nonce (20 random bytes)
fn random_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; STATE_NONCE_LEN / 2] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::store::MemoryStore;

    fn setup() -> (FlowsData, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let flows = FlowsData::new(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            Duration::from_secs(20),
        );
        (flows, store)
    }

    #[tokio::test]
    async fn test_claim_then_running_then_reset() {
        let (flows, _store) = setup();

        assert!(!flows.is_renew_running().unwrap());
        assert!(flows
            .claim_renew_running(FlowKind::SilentRenewCode)
            .await
            .unwrap());
        assert!(flows.is_renew_running().unwrap());

        flows.reset_renew_running().unwrap();
        assert!(!flows.is_renew_running().unwrap());
    }

    #[tokio::test]
    async fn test_second_claim_loses_while_running() {
        let (flows, _store) = setup();

        assert!(flows
            .claim_renew_running(FlowKind::RefreshToken)
            .await
            .unwrap());
        assert!(!flows
            .claim_renew_running(FlowKind::RefreshToken)
            .await
            .unwrap());
    }

    #[test]
    fn test_stuck_running_record_reads_as_idle_and_is_reset() {
        let (flows, store) = setup();

        let mut record = RenewalLockRecord::running(FlowKind::SilentRenewCode);
        record.started_at_utc = Utc::now() - chrono::Duration::seconds(120);
        store
            .write(
                keys::RENEWAL_RUNNING,
                &serde_json::to_string(&record).unwrap(),
            )
            .unwrap();

        assert!(!flows.is_renew_running().unwrap());
        // The reader wrote the reset
        assert_eq!(
            store.read(keys::RENEWAL_RUNNING).unwrap().as_deref(),
            Some("")
        );
    }

    #[test]
    fn test_auth_state_control_round_trip() {
        let (flows, _store) = setup();

        let state = flows
            .create_auth_state_control(FlowKind::SilentRenewCode)
            .unwrap();
        assert_eq!(state.len(), STATE_NONCE_LEN);

        let read = flows
            .read_auth_state_control(FlowKind::SilentRenewCode)
            .unwrap();
        assert_eq!(read.as_deref(), Some(state.as_str()));
    }

    #[test]
    fn test_auth_state_control_flow_mismatch_reads_as_absent() {
        let (flows, _store) = setup();

        flows
            .create_auth_state_control(FlowKind::SilentRenewCode)
            .unwrap();
        assert_eq!(flows.read_auth_state_control(FlowKind::Login).unwrap(), None);
    }

    #[test]
    fn test_stale_silent_renew_control_reads_as_absent() {
        let (flows, store) = setup();

        let record = AuthStateControlRecord {
            launched_from: FlowKind::SilentRenewCode,
            started_at_utc: Utc::now() - chrono::Duration::seconds(120),
            state: "stale".to_string(),
        };
        store
            .write(
                keys::AUTH_STATE_CONTROL,
                &serde_json::to_string(&record).unwrap(),
            )
            .unwrap();

        assert_eq!(
            flows
                .read_auth_state_control(FlowKind::SilentRenewCode)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_existing_state_is_reused() {
        let (flows, _store) = setup();

        let first = flows
            .existing_or_create_auth_state_control(FlowKind::SilentRenewCode)
            .unwrap();
        let second = flows
            .existing_or_create_auth_state_control(FlowKind::SilentRenewCode)
            .unwrap();
        assert_eq!(first, second);
    }
}
