//! Two-key bakery lock over the shared store.
//!
//! The store offers no compare-and-swap, so exclusivity is negotiated with
//! plain reads and writes: announce intent on the x key, claim priority on
//! the y key, then re-check both around a randomized settle delay. The
//! result is "probably exclusive" — a rare double acquisition under
//! pathological timing is tolerated because the orchestrator's timeout and
//! retry layer absorbs it. Losing the race is a normal outcome, not an
//! error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{read_non_empty, SharedStore, StoreError};

/// Upper bound of the randomized settle delay
const SETTLE_JITTER_MS: u64 = 100;

/// Priority claim parked on the y key while an acquisition is in flight.
///
/// The timestamp lets the next contender detect a claim left behind by a
/// dead instance and clear it instead of waiting forever.
#[derive(Debug, Serialize, Deserialize)]
struct PriorityClaim {
    id: String,
    started_at_utc: DateTime<Utc>,
}

impl PriorityClaim {
    fn is_stuck(&self, stuck_after: Duration) -> bool {
        let elapsed = (Utc::now() - self.started_at_utc)
            .num_milliseconds()
            .unsigned_abs();
        elapsed as u128 >= stuck_after.as_millis()
    }
}

/// Ephemeral per-attempt identity; never outlives one acquisition run.
struct MutexTicket {
    id: String,
}

impl MutexTicket {
    fn new() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 6] = rng.gen();
        Self {
            id: format!(
                "{}_{}",
                hex::encode(bytes),
                Utc::now().timestamp_subsec_millis()
            ),
        }
    }
}

/// Gives one instance, among any number racing concurrently, the exclusive
/// right to transition a guarded record from idle to claimed.
pub struct MutualExclusionLock {
    store: Arc<dyn SharedStore>,
    stuck_after: Duration,
    x_key: &'static str,
    y_key: &'static str,
}

impl MutualExclusionLock {
    pub fn new(
        store: Arc<dyn SharedStore>,
        x_key: &'static str,
        y_key: &'static str,
        stuck_after: Duration,
    ) -> Self {
        Self {
            store,
            stuck_after,
            x_key,
            y_key,
        }
    }

    /// Run one acquisition attempt.
    ///
    /// `already_claimed` reads the guarded record's current state; `claim`
    /// writes the claimed state. Returns `true` only when *this* call
    /// performed the transition; `false` means another instance holds the
    /// resource or had already claimed it.
    pub async fn try_acquire<C, W>(&self, already_claimed: C, claim: W) -> Result<bool, StoreError>
    where
        C: Fn() -> Result<bool, StoreError>,
        W: Fn() -> Result<(), StoreError>,
    {
        let ticket = MutexTicket::new();

        // Announce intent
        self.store.write(self.x_key, &ticket.id)?;

        // Someone else holds priority: concede, clearing the claim first if
        // its holder is presumed dead so the next attempt starts clean.
        if let Some(raw) = read_non_empty(self.store.as_ref(), self.y_key)? {
            let holder_is_stuck = match serde_json::from_str::<PriorityClaim>(&raw) {
                Ok(holder) => holder.is_stuck(self.stuck_after),
                // Unreadable claims cannot age out on their own
                Err(_) => true,
            };

            if holder_is_stuck {
                debug!(ticket = %ticket.id, "Priority holder is probably stuck, clearing claim");
                self.store.write(self.y_key, "")?;
            }

            return Ok(false);
        }

        // Claim priority
        let claim_record = PriorityClaim {
            id: ticket.id.clone(),
            started_at_utc: Utc::now(),
        };
        self.store
            .write(self.y_key, &serde_json::to_string(&claim_record)?)?;

        // If our intent was overwritten, another instance raced in between;
        // give the race a moment to settle, then see who kept priority.
        if self.store.read(self.x_key)?.as_deref() != Some(ticket.id.as_str()) {
            let jitter = rand::thread_rng().gen_range(0..=SETTLE_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            if !self.holds_priority(&ticket)? {
                debug!(ticket = %ticket.id, "Lost lock race after settle delay");
                return Ok(false);
            }
        }

        // We hold priority; transition the guarded record if still free
        if already_claimed()? {
            debug!(ticket = %ticket.id, "Guarded record already claimed");
            return Ok(false);
        }

        claim()?;
        self.store.write(self.y_key, "")?;
        Ok(true)
    }

    fn holds_priority(&self, ticket: &MutexTicket) -> Result<bool, StoreError> {
        let Some(raw) = read_non_empty(self.store.as_ref(), self.y_key)? else {
            return Ok(false);
        };

        match serde_json::from_str::<PriorityClaim>(&raw) {
            Ok(current) => Ok(current.id == ticket.id),
            Err(_) => Ok(false),
        }
    }
}
