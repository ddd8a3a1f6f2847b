//! Read-side view of the stored credentials.
//!
//! Token storage belongs to the host (whoever processes the authorization
//! callback writes the record); the core only ever needs three questions
//! answered: are the credentials expired, which flow established them, and
//! what are the current tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::records::FlowKind;
use crate::store::{keys, read_non_empty, SharedStore, StoreError};

/// The tokens a successful renewal resolves with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub id_token: String,
}

/// Reports the current credential state to the renewal machinery.
pub trait CredentialReader: Send + Sync {
    /// The flow the current session was established with.
    fn active_flow(&self) -> Result<FlowKind, StoreError>;

    /// The stored tokens, when present and not expired.
    fn current_tokens(&self) -> Result<Option<TokenPair>, StoreError>;

    /// Whether the stored credentials are expired or absent.
    fn is_expired(&self) -> Result<bool, StoreError>;
}

/// Credential record as persisted under [`keys::CREDENTIALS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    /// When the access token expires
    pub expires_at_utc: DateTime<Utc>,
    /// The flow that produced these credentials
    pub flow: FlowKind,
    pub id_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl CredentialRecord {
    fn is_expired(&self) -> bool {
        self.expires_at_utc < Utc::now()
    }
}

/// [`CredentialReader`] over the shared store's credential record.
pub struct StoredCredentials {
    store: Arc<dyn SharedStore>,
}

impl StoredCredentials {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn read_record(&self) -> Result<Option<CredentialRecord>, StoreError> {
        let Some(raw) = read_non_empty(self.store.as_ref(), keys::CREDENTIALS)? else {
            return Ok(None);
        };
        // An unreadable record counts as absent, same as an expired one
        Ok(serde_json::from_str(&raw).ok())
    }
}

impl CredentialReader for StoredCredentials {
    fn active_flow(&self) -> Result<FlowKind, StoreError> {
        Ok(self
            .read_record()?
            .map(|record| record.flow)
            .unwrap_or_default())
    }

    fn current_tokens(&self) -> Result<Option<TokenPair>, StoreError> {
        let record = self.read_record()?;
        Ok(record.filter(|r| !r.is_expired()).map(|r| TokenPair {
            access_token: r.access_token,
            id_token: r.id_token,
        }))
    }

    fn is_expired(&self) -> Result<bool, StoreError> {
        Ok(self
            .read_record()?
            .map(|record| record.is_expired())
            .unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::store::MemoryStore;

    fn write_record(store: &MemoryStore, expires_in_secs: i64) {
        let record = CredentialRecord {
            access_token: "at".to_string(),
            expires_at_utc: Utc::now() + Duration::seconds(expires_in_secs),
            flow: FlowKind::SilentRenewCode,
            id_token: "it".to_string(),
            refresh_token: None,
        };
        store
            .write(keys::CREDENTIALS, &serde_json::to_string(&record).unwrap())
            .unwrap();
    }

    #[test]
    fn test_absent_record_is_expired() {
        let store = Arc::new(MemoryStore::new());
        let credentials = StoredCredentials::new(store);

        assert!(credentials.is_expired().unwrap());
        assert_eq!(credentials.current_tokens().unwrap(), None);
        assert_eq!(credentials.active_flow().unwrap(), FlowKind::Login);
    }

    #[test]
    fn test_valid_record_yields_tokens() {
        let store = Arc::new(MemoryStore::new());
        write_record(&store, 3600);
        let credentials = StoredCredentials::new(store);

        assert!(!credentials.is_expired().unwrap());
        let tokens = credentials.current_tokens().unwrap().unwrap();
        assert_eq!(tokens.id_token, "it");
        assert_eq!(tokens.access_token, "at");
        assert_eq!(
            credentials.active_flow().unwrap(),
            FlowKind::SilentRenewCode
        );
    }

    #[test]
    fn test_expired_record_yields_no_tokens() {
        let store = Arc::new(MemoryStore::new());
        write_record(&store, -60);
        let credentials = StoredCredentials::new(store);

        assert!(credentials.is_expired().unwrap());
        assert_eq!(credentials.current_tokens().unwrap(), None);
    }
}
