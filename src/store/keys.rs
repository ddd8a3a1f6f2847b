//! Key names owned by this crate in the shared store.

/// Correlation record for an outbound authorization request.
pub const AUTH_STATE_CONTROL: &str = "auth_state_control";

/// Credential record read by [`crate::credentials::StoredCredentials`].
pub const CREDENTIALS: &str = "credentials";

/// Host-provided authorize parameters picked up by the periodic check.
pub const CUSTOM_REQUEST_PARAMS: &str = "custom_request_params";

/// The "a renewal is in progress" claim guarded by the mutex.
pub const RENEWAL_RUNNING: &str = "renewal_running";

/// Bakery-lock intent key for the renewal claim.
pub const RENEW_LOCK_X: &str = "renew_lock_x";

/// Bakery-lock priority key for the renewal claim.
pub const RENEW_LOCK_Y: &str = "renew_lock_y";
