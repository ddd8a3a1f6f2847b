use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use renew_sync::bus::{BroadcastBus, LocalBus};
use renew_sync::config::Config;
use renew_sync::credentials::CredentialRecord;
use renew_sync::renew::{
    CallbackContext, RenewRequest, RenewalTransport, TransportError, ValidationOutcome,
};
use renew_sync::store::records::FlowKind;
use renew_sync::store::{keys, MemoryStore, SharedStore};
use renew_sync::Instance;

/// How long the demo transport's minted credentials stay valid
const DEMO_TOKEN_TTL_SECONDS: i64 = 45;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "renew-sync demo starting");

    let config = Config::load()?;

    // One shared session: a store, a bus, and a transport all instances use
    let store = Arc::new(MemoryStore::new()) as Arc<dyn SharedStore>;
    let bus = Arc::new(LocalBus::new()) as Arc<dyn BroadcastBus>;
    let transport =
        Arc::new(DemoTransport::new(Arc::clone(&store))) as Arc<dyn RenewalTransport>;

    // Seed credentials that are already expired so the first periodic
    // check has renewal work to do
    seed_expired_credentials(store.as_ref())?;

    // Three instances of the same logical session
    let mut instances = Vec::new();
    for n in 0..3 {
        let mut instance_config = config.clone();
        instance_config.instance.id = format!("{}-{n}", config.instance.id);

        let instance = Instance::new(
            instance_config,
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&transport),
        );
        instance.start_periodic_check();
        instances.push(instance);
    }
    info!(
        instances = instances.len(),
        interval_seconds = config.renew.check_interval_seconds,
        "Periodic checks running"
    );

    shutdown_signal().await;

    info!("Shutting down instances");
    for instance in &instances {
        instance.close().await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

fn seed_expired_credentials(store: &dyn SharedStore) -> anyhow::Result<()> {
    let record = CredentialRecord {
        access_token: "seed-access-token".to_string(),
        expires_at_utc: Utc::now() - ChronoDuration::seconds(60),
        flow: FlowKind::SilentRenewCode,
        id_token: "seed-id-token".to_string(),
        refresh_token: None,
    };
    store.write(keys::CREDENTIALS, &serde_json::to_string(&record)?)?;
    Ok(())
}

/// Demo transport: mints short-lived credentials after a simulated round
/// trip, so the renewal cycle repeats while the demo runs.
struct DemoTransport {
    store: Arc<dyn SharedStore>,
}

impl DemoTransport {
    fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RenewalTransport for DemoTransport {
    async fn exchange(&self, request: RenewRequest) -> Result<CallbackContext, TransportError> {
        info!(flow = ?request.flow, "Demo exchange running");
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;

        let minted_at = Utc::now();
        let record = CredentialRecord {
            access_token: format!("access-{}", minted_at.timestamp()),
            expires_at_utc: minted_at + ChronoDuration::seconds(DEMO_TOKEN_TTL_SECONDS),
            flow: request.flow,
            id_token: format!("id-{}", minted_at.timestamp()),
            refresh_token: None,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.store
            .write(keys::CREDENTIALS, &payload)
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(CallbackContext {
            access_token: Some(record.access_token),
            id_token: Some(record.id_token),
            is_renew_process: true,
            refresh_token: None,
            session_state: None,
            state: Some(request.state),
            validation: ValidationOutcome::Ok,
        })
    }
}
