use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub election: ElectionConfig,
    pub instance: InstanceConfig,
    pub renew: RenewConfig,
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Client id shared by every instance of the logical session; prefixes
    /// channel names so unrelated sessions never cross-talk
    pub client_id: String,
    /// Unique id of this instance
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct RenewConfig {
    /// How often the periodic check fires (seconds)
    pub check_interval_seconds: u64,
    /// Additional attempts granted after the first renewal timeout
    pub max_retry_attempts: u32,
    /// Whether automatic silent renewal is enabled at all
    pub silent_renew: bool,
    /// Bounds the renewal wait and doubles as the stuck threshold, so
    /// operators tune one knob for both
    pub silent_renew_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How often followers renegotiate leadership (ms)
    pub fallback_interval_ms: u64,
    /// How long instances have to object to a candidacy (ms)
    pub response_time_ms: u64,
}

impl Default for RenewConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            max_retry_attempts: crate::renew::MAX_RETRY_ATTEMPTS,
            silent_renew: true,
            silent_renew_timeout_seconds: 20,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            fallback_interval_ms: 2000,
            response_time_ms: 1000,
        }
    }
}

impl RenewConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn silent_renew_timeout(&self) -> Duration {
        Duration::from_secs(self.silent_renew_timeout_seconds)
    }
}

impl ElectionConfig {
    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms)
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let instance_id =
            std::env::var("INSTANCE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let client_id = std::env::var("CLIENT_ID").unwrap_or_else(|_| "renew-sync".to_string());

        let silent_renew = std::env::var("SILENT_RENEW")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let check_interval_seconds = std::env::var("CHECK_INTERVAL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let silent_renew_timeout_seconds = std::env::var("SILENT_RENEW_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);

        let max_retry_attempts = std::env::var("MAX_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::renew::MAX_RETRY_ATTEMPTS);

        let fallback_interval_ms = std::env::var("ELECTION_FALLBACK_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);

        let response_time_ms = std::env::var("ELECTION_RESPONSE_TIME_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        let config = Config {
            election: ElectionConfig {
                fallback_interval_ms,
                response_time_ms,
            },
            instance: InstanceConfig {
                client_id,
                id: instance_id,
            },
            renew: RenewConfig {
                check_interval_seconds,
                max_retry_attempts,
                silent_renew,
                silent_renew_timeout_seconds,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.instance.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "INSTANCE_ID cannot be empty".to_string(),
            ));
        }

        if self.renew.silent_renew_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "SILENT_RENEW_TIMEOUT_SECONDS must be positive".to_string(),
            ));
        }

        if self.renew.check_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "CHECK_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }

        if self.election.response_time_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ELECTION_RESPONSE_TIME_MS must be positive".to_string(),
            ));
        }

        if self.renew.check_interval_seconds < self.renew.silent_renew_timeout_seconds {
            tracing::warn!(
                "Check interval {}s is shorter than the renewal timeout {}s. \
                 Overlapping checks will be skipped, not queued.",
                self.renew.check_interval_seconds,
                self.renew.silent_renew_timeout_seconds
            );
        }

        Ok(())
    }
}
