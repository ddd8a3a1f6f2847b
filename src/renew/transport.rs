//! The seam to whatever actually exchanges credentials.
//!
//! The core never talks to a token endpoint itself; it hands the transport
//! a correlation state and waits, racing the exchange against the
//! configured timeout. Hosts plug in an iframe-style authorize round trip,
//! a refresh-token grant, or a stub.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::records::FlowKind;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP status {0}")]
    Http(u16),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Exchange rejected: {0}")]
    Rejected(String),
}

/// Validation verdict the transport attaches to a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    LoginRequired,
    Ok,
    StatesDoNotMatch,
}

/// One outbound renewal request.
#[derive(Debug, Clone)]
pub struct RenewRequest {
    /// Extra authorize-request parameters supplied by the caller
    pub custom_params: HashMap<String, String>,
    pub flow: FlowKind,
    /// Correlation state the callback must echo back
    pub state: String,
}

/// Everything one completed exchange produced.
///
/// Consumed by the orchestrator to decide success or failure, then
/// discarded — persisting the tokens is the transport host's concern.
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub is_renew_process: bool,
    pub refresh_token: Option<String>,
    pub session_state: Option<String>,
    /// Correlation state echoed by the callback
    pub state: Option<String>,
    pub validation: ValidationOutcome,
}

/// Performs the actual credential exchange.
#[async_trait]
pub trait RenewalTransport: Send + Sync {
    async fn exchange(&self, request: RenewRequest) -> Result<CallbackContext, TransportError>;
}
