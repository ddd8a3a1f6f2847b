//! Drives exactly one externally-visible renewal outcome per invocation.
//!
//! Every instance that wants fresh credentials runs the same decision
//! loop: if a renewal is already underway, wait for its completion
//! announcement; otherwise the group leader claims the renewal record and
//! performs the exchange while everyone else waits. A timeout on either
//! side re-enters the loop with an incremented attempt counter — the
//! leadership decision is deliberately re-made each attempt, because the
//! leader may have changed in the meantime. Timeout is the only condition
//! retried here; transport and validation failures propagate immediately.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::config::RenewConfig;
use crate::credentials::{CredentialReader, TokenPair};
use crate::flows::FlowsData;
use crate::store::records::FlowKind;
use crate::store::StoreError;
use crate::sync::{ElectionError, InstanceSync};

use super::transport::{CallbackContext, RenewRequest, RenewalTransport, TransportError, ValidationOutcome};

/// Additional attempts granted after the first timeout
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum RenewError {
    #[error("Completion was announced but the stored credentials are not valid")]
    CompletedWithoutCredentials,
    #[error("Exceeded max renewal retry attempts")]
    RetryExceeded,
    #[error("Callback state does not match the stored auth state control")]
    StateMismatch,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub struct RenewalOrchestrator {
    config: RenewConfig,
    credentials: Arc<dyn CredentialReader>,
    flows: Arc<FlowsData>,
    sync: Arc<InstanceSync>,
    transport: Arc<dyn RenewalTransport>,
}

impl RenewalOrchestrator {
    pub fn new(
        config: RenewConfig,
        credentials: Arc<dyn CredentialReader>,
        flows: Arc<FlowsData>,
        sync: Arc<InstanceSync>,
        transport: Arc<dyn RenewalTransport>,
    ) -> Self {
        Self {
            config,
            credentials,
            flows,
            sync,
            transport,
        }
    }

    /// Obtain fresh credentials, renewing or waiting as appropriate.
    ///
    /// Resolves with the new token pair, with `None` for benign
    /// nothing-to-do cases (silent renew disabled, or the exchange
    /// completed without leaving valid credentials to hand out), or fails
    /// with one of the terminal [`RenewError`] kinds.
    pub async fn force_renew(
        &self,
        custom_params: Option<HashMap<String, String>>,
    ) -> Result<Option<TokenPair>, RenewError> {
        if !self.config.silent_renew {
            debug!("Silent renew disabled, nothing to do");
            return Ok(None);
        }

        let flow = self.credentials.active_flow()?;
        let custom_params = custom_params.unwrap_or_default();
        let wait = self.config.silent_renew_timeout();
        let mut attempt: u32 = 0;

        loop {
            // A renewal already running (and not stuck) means someone else
            // originated the attempt — wait for it no matter who leads.
            // Leadership only governs who performs the exchange.
            let already_running = self.flows.is_renew_running()?;

            let is_leader = if already_running {
                false
            } else {
                match self.sync.is_leader().await {
                    Ok(is_leader) => is_leader,
                    Err(ElectionError::ChannelUnavailable) => {
                        warn!("Leadership channel unavailable, acting as follower");
                        false
                    }
                }
            };

            if is_leader {
                if self.flows.claim_renew_running(flow).await? {
                    debug!(attempt, "Acting as renewal leader");
                    let exchange = self.perform_exchange(flow, &custom_params);

                    match tokio::time::timeout(wait, exchange).await {
                        // Success and hard failure are both terminal
                        Ok(outcome) => return outcome,
                        Err(_) => {
                            warn!(attempt, "Renewal exchange timed out");
                            attempt += 1;
                            if attempt > self.config.max_retry_attempts {
                                return Err(RenewError::RetryExceeded);
                            }
                            continue;
                        }
                    }
                }
                // Lost the claim race: fall through and wait like a follower
                debug!("Renewal claim already taken, waiting for completion");
            }

            // Follower wait: a fresh subscription, bounded by the same
            // timeout that bounds the leader's exchange.
            let mut finished = self.sync.subscribe_renew_finished();
            let completed = match tokio::time::timeout(wait, finished.recv()).await {
                Ok(Ok(event)) => {
                    debug!(completed_by = %event.completed_by, "Completion announced");
                    true
                }
                // Lagging still means a completion happened
                Ok(Err(RecvError::Lagged(_))) => true,
                Ok(Err(RecvError::Closed)) => false,
                Err(_) => false,
            };

            if completed {
                return match self.credentials.current_tokens()? {
                    Some(tokens) => Ok(Some(tokens)),
                    // The announcer claimed success but storage disagrees;
                    // surfacing beats silently renewing on top of it
                    None => Err(RenewError::CompletedWithoutCredentials),
                };
            }

            warn!(attempt, "No completion announcement before the timeout");
            attempt += 1;
            if attempt > self.config.max_retry_attempts {
                return Err(RenewError::RetryExceeded);
            }
        }
    }

    /// The leader's half: run the exchange, validate the callback, clear
    /// the claim and announce. Only reached while holding the claim.
    async fn perform_exchange(
        &self,
        flow: FlowKind,
        custom_params: &HashMap<String, String>,
    ) -> Result<Option<TokenPair>, RenewError> {
        let state = self.flows.existing_or_create_auth_state_control(flow)?;

        let request = RenewRequest {
            custom_params: custom_params.clone(),
            flow,
            state,
        };

        let context = match self.transport.exchange(request).await {
            Ok(context) => context,
            Err(err) => {
                // Release the claim so followers are not stalled until the
                // stuck threshold, then propagate verbatim
                self.flows.reset_renew_running()?;
                return Err(err.into());
            }
        };

        self.validate_context(&context, flow)?;

        self.flows.reset_renew_running()?;
        self.sync.notify_renew_finished();

        if self.credentials.current_tokens()?.is_none() {
            warn!("Exchange completed but stored credentials are not valid");
            return Ok(None);
        }

        Ok(tokens_from(&context))
    }

    /// Correlation and validation checks on a returned callback.
    ///
    /// A state mismatch mutates no shared state at all — the claim and
    /// the control record stay untouched, so a spoofed or stale callback
    /// cannot disturb a concurrent legitimate attempt.
    fn validate_context(
        &self,
        context: &CallbackContext,
        flow: FlowKind,
    ) -> Result<(), RenewError> {
        if context.validation == ValidationOutcome::StatesDoNotMatch {
            error!("Transport reported a correlation state mismatch");
            return Err(RenewError::StateMismatch);
        }

        let Some(expected) = self.flows.read_auth_state_control(flow)? else {
            error!("No auth state control to correlate the callback against");
            return Err(RenewError::StateMismatch);
        };

        if context.state.as_deref() != Some(expected.as_str()) {
            error!(
                callback_state = ?context.state,
                "Callback state does not match the stored auth state control"
            );
            return Err(RenewError::StateMismatch);
        }

        if context.validation == ValidationOutcome::LoginRequired {
            // A hard rejection, not a timeout: clear the claim and propagate
            self.flows.reset_renew_running()?;
            return Err(RenewError::Transport(TransportError::Rejected(
                "login required".to_string(),
            )));
        }

        Ok(())
    }
}

fn tokens_from(context: &CallbackContext) -> Option<TokenPair> {
    match (&context.id_token, &context.access_token) {
        (Some(id_token), Some(access_token)) => Some(TokenPair {
            access_token: access_token.clone(),
            id_token: id_token.clone(),
        }),
        _ => None,
    }
}
