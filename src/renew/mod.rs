//! The renewal machinery: the transport seam, the per-invocation
//! orchestration state machine, and the periodic check driving it.

pub mod orchestrator;
pub mod periodic;
pub mod transport;

pub use orchestrator::{RenewError, RenewalOrchestrator, MAX_RETRY_ATTEMPTS};
pub use periodic::PeriodicCheckScheduler;
pub use transport::{
    CallbackContext, RenewRequest, RenewalTransport, TransportError, ValidationOutcome,
};
