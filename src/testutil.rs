//! Shared test helpers — available to all `#[cfg(test)]` modules in the crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::bus::{BroadcastBus, LocalBus};
use crate::config::{Config, ElectionConfig, InstanceConfig, RenewConfig};
use crate::credentials::CredentialRecord;
use crate::renew::{
    CallbackContext, RenewRequest, RenewalTransport, TransportError, ValidationOutcome,
};
use crate::store::records::FlowKind;
use crate::store::{keys, MemoryStore, SharedStore};
use crate::Instance;

/// A `Config` with timings shrunk for tests: 1s renewal timeout (also the
/// stuck threshold), 100ms election response window.
pub fn test_config(instance_id: &str) -> Config {
    Config {
        election: ElectionConfig {
            fallback_interval_ms: 200,
            response_time_ms: 100,
        },
        instance: InstanceConfig {
            client_id: "test".to_string(),
            id: instance_id.to_string(),
        },
        renew: RenewConfig {
            check_interval_seconds: 1,
            max_retry_attempts: 3,
            silent_renew: true,
            silent_renew_timeout_seconds: 1,
        },
    }
}

/// Build an instance on the shared fixtures with [`test_config`] timings.
pub fn make_instance(
    instance_id: &str,
    store: &Arc<MemoryStore>,
    bus: &Arc<LocalBus>,
    transport: &Arc<StubTransport>,
) -> Instance {
    Instance::new(
        test_config(instance_id),
        Arc::clone(store) as Arc<dyn SharedStore>,
        Arc::clone(bus) as Arc<dyn BroadcastBus>,
        Arc::clone(transport) as Arc<dyn RenewalTransport>,
    )
}

/// Write a credential record that expired a minute ago.
pub fn write_expired_credentials(store: &MemoryStore, flow: FlowKind) {
    let record = CredentialRecord {
        access_token: "access-token-old".to_string(),
        expires_at_utc: Utc::now() - ChronoDuration::seconds(60),
        flow,
        id_token: "id-token-old".to_string(),
        refresh_token: None,
    };
    store
        .write(keys::CREDENTIALS, &serde_json::to_string(&record).unwrap())
        .unwrap();
}

/// What a [`StubTransport`] does when asked to exchange.
#[derive(Debug, Clone, Copy)]
pub enum StubBehavior {
    /// Return a callback whose state does not match the request's
    EchoMismatch,
    /// Fail with a network error
    Fail,
    /// Never complete
    Hang,
    /// Write fresh credentials to the store and echo the request state
    Succeed,
}

/// Scripted transport double. Counts invocations so tests can assert the
/// exchange ran exactly once across a whole instance group.
pub struct StubTransport {
    behavior: StubBehavior,
    pub calls: AtomicUsize,
    store: Arc<MemoryStore>,
}

impl StubTransport {
    pub fn new(behavior: StubBehavior, store: &Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            store: Arc::clone(store),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenewalTransport for StubTransport {
    async fn exchange(&self, request: RenewRequest) -> Result<CallbackContext, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            StubBehavior::Hang => std::future::pending().await,
            StubBehavior::Fail => Err(TransportError::Network("stub transport down".to_string())),
            StubBehavior::EchoMismatch => Ok(CallbackContext {
                access_token: None,
                id_token: None,
                is_renew_process: true,
                refresh_token: None,
                session_state: None,
                state: Some("not-the-request-state".to_string()),
                validation: ValidationOutcome::Ok,
            }),
            StubBehavior::Succeed => {
                // A real exchange takes a network round trip
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;

                // The callback-processing host persists the new credentials
                write_valid_credentials_new(&self.store, request.flow);

                Ok(CallbackContext {
                    access_token: Some("access-token-new".to_string()),
                    id_token: Some("id-token-new".to_string()),
                    is_renew_process: true,
                    refresh_token: Some("refresh-token-new".to_string()),
                    session_state: Some("session-state".to_string()),
                    state: Some(request.state),
                    validation: ValidationOutcome::Ok,
                })
            }
        }
    }
}

fn write_valid_credentials_new(store: &MemoryStore, flow: FlowKind) {
    let record = CredentialRecord {
        access_token: "access-token-new".to_string(),
        expires_at_utc: Utc::now() + ChronoDuration::seconds(3600),
        flow,
        id_token: "id-token-new".to_string(),
        refresh_token: Some("refresh-token-new".to_string()),
    };
    store
        .write(keys::CREDENTIALS, &serde_json::to_string(&record).unwrap())
        .unwrap();
}
