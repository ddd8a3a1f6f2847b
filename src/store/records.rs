use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which authorization flow launched the current renewal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    #[default]
    Login,
    SilentRenewCode,
    RefreshToken,
}

/// Stored state of the renewal claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalState {
    Idle,
    Running,
}

/// The persisted "a renewal is in progress" claim.
///
/// Written by the one instance that won the renewal lock, cleared when the
/// renewal completes or fails terminally. A Running record older than the
/// stuck threshold was abandoned by a dead instance and must be read as
/// Idle — the reader that detects this writes the reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalLockRecord {
    /// The flow that launched the renewal
    pub launched_from: FlowKind,
    /// When the renewal was launched
    pub started_at_utc: DateTime<Utc>,
    pub state: RenewalState,
}

impl RenewalLockRecord {
    /// A fresh Running claim launched now from the given flow.
    pub fn running(launched_from: FlowKind) -> Self {
        Self {
            launched_from,
            started_at_utc: Utc::now(),
            state: RenewalState::Running,
        }
    }

    /// Whether this record has outlived `stuck_after` and is presumed
    /// abandoned. Elapsed time is floored to whole milliseconds, so the
    /// comparison is inclusive — a record aged exactly the threshold
    /// already failed to finish within it.
    pub fn is_stuck(&self, stuck_after: Duration) -> bool {
        elapsed_millis(self.started_at_utc) >= stuck_after.as_millis()
    }
}

/// Correlation record for an outbound authorization request.
///
/// The `state` nonce ties a callback to the request that produced it;
/// a callback whose state does not match is a forged or stale response
/// and must be rejected without touching any other shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStateControlRecord {
    /// The flow that initiated the authorization request
    pub launched_from: FlowKind,
    /// When the flow was initiated
    pub started_at_utc: DateTime<Utc>,
    /// Opaque anti-forgery nonce echoed back by the callback
    pub state: String,
}

impl AuthStateControlRecord {
    pub fn new(state: String, launched_from: FlowKind) -> Self {
        Self {
            launched_from,
            started_at_utc: Utc::now(),
            state,
        }
    }

    /// Silent-renew correlation records expire after the renewal timeout;
    /// a stale one must be discarded rather than matched. Records from
    /// interactive flows never expire this way.
    pub fn is_stale(&self, renew_timeout: Duration) -> bool {
        self.launched_from == FlowKind::SilentRenewCode
            && elapsed_millis(self.started_at_utc) >= renew_timeout.as_millis()
    }
}

/// Absolute elapsed wall-clock time since `then`, in milliseconds.
///
/// Uses the absolute difference because store timestamps come from other
/// instances whose clocks may sit slightly ahead of ours.
fn elapsed_millis(then: DateTime<Utc>) -> u128 {
    (Utc::now() - then).num_milliseconds().unsigned_abs() as u128
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_running_record_round_trip() {
        let record = RenewalLockRecord::running(FlowKind::SilentRenewCode);
        let json = serde_json::to_string(&record).unwrap();
        let parsed: RenewalLockRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.state, RenewalState::Running);
        assert_eq!(parsed.launched_from, FlowKind::SilentRenewCode);
    }

    #[test]
    fn test_fresh_record_is_not_stuck() {
        let record = RenewalLockRecord::running(FlowKind::RefreshToken);
        assert!(!record.is_stuck(Duration::from_secs(20)));
    }

    #[test]
    fn test_old_record_is_stuck() {
        let mut record = RenewalLockRecord::running(FlowKind::Login);
        record.started_at_utc = Utc::now() - ChronoDuration::seconds(60);
        assert!(record.is_stuck(Duration::from_secs(20)));
    }

    #[test]
    fn test_clock_skew_counts_as_elapsed() {
        // A record stamped in the future (peer clock ahead of ours) still
        // ages out by absolute difference.
        let mut record = RenewalLockRecord::running(FlowKind::Login);
        record.started_at_utc = Utc::now() + ChronoDuration::seconds(60);
        assert!(record.is_stuck(Duration::from_secs(20)));
    }

    #[test]
    fn test_silent_renew_control_record_goes_stale() {
        let mut record =
            AuthStateControlRecord::new("abc".into(), FlowKind::SilentRenewCode);
        assert!(!record.is_stale(Duration::from_secs(20)));

        record.started_at_utc = Utc::now() - ChronoDuration::seconds(60);
        assert!(record.is_stale(Duration::from_secs(20)));
    }

    #[test]
    fn test_login_control_record_never_goes_stale() {
        let mut record = AuthStateControlRecord::new("abc".into(), FlowKind::Login);
        record.started_at_utc = Utc::now() - ChronoDuration::seconds(3600);
        assert!(!record.is_stale(Duration::from_secs(20)));
    }
}
