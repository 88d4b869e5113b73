use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spoils_of_war::{ContributionPolicy, LedgerConfig, MultiplierPolicy};

use crate::SchedulerError;

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_MAX_TICK_RETRIES: u32 = 5;
pub const DEFAULT_MAX_PARALLEL_LEDGERS: usize = 4;
pub const DEFAULT_ISSUER_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;

/// Sweep cadence and retry policy of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scheduler_id: String,
    pub tick_interval_ms: u64,
    pub max_tick_retries: u32,
    pub max_parallel_ledgers: usize,
    pub issuer_timeout_ms: u64,
    pub finalize_immediately: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_id: "spoils-scheduler".to_string(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_tick_retries: DEFAULT_MAX_TICK_RETRIES,
            max_parallel_ledgers: DEFAULT_MAX_PARALLEL_LEDGERS,
            issuer_timeout_ms: DEFAULT_ISSUER_TIMEOUT_MS,
            finalize_immediately: true,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn issuer_timeout(&self) -> Duration {
        Duration::from_millis(self.issuer_timeout_ms)
    }

    pub fn with_tick_interval_ms(mut self, tick_interval_ms: u64) -> Result<Self, SchedulerError> {
        if tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms must be positive"));
        }
        self.tick_interval_ms = tick_interval_ms;
        Ok(self)
    }

    pub fn with_max_tick_retries(mut self, max_tick_retries: u32) -> Result<Self, SchedulerError> {
        if max_tick_retries == 0 {
            return Err(invalid("max_tick_retries must be positive"));
        }
        self.max_tick_retries = max_tick_retries;
        Ok(self)
    }

    pub fn with_max_parallel_ledgers(
        mut self,
        max_parallel_ledgers: usize,
    ) -> Result<Self, SchedulerError> {
        if max_parallel_ledgers == 0 {
            return Err(invalid("max_parallel_ledgers must be positive"));
        }
        self.max_parallel_ledgers = max_parallel_ledgers;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.scheduler_id.trim().is_empty() {
            return Err(invalid("scheduler_id cannot be empty"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms must be positive"));
        }
        if self.max_tick_retries == 0 {
            return Err(invalid("max_tick_retries must be positive"));
        }
        if self.max_parallel_ledgers == 0 {
            return Err(invalid("max_parallel_ledgers must be positive"));
        }
        if self.issuer_timeout_ms == 0 {
            return Err(invalid("issuer_timeout_ms must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

/// Presence lookups go to `base_url` when set; otherwise every player is
/// treated as `default_online`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
    pub default_online: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            default_online: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub alert_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("output/spoils_of_war"),
            alert_dir: None,
        }
    }
}

/// Root of the scheduler's TOML configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerFileConfig {
    pub ledger: LedgerConfig,
    pub contribution: ContributionPolicy,
    pub multiplier: MultiplierPolicy,
    pub scheduler: SchedulerConfig,
    pub issuer: IssuerConfig,
    pub presence: PresenceConfig,
    pub storage: StorageConfig,
}

impl SchedulerFileConfig {
    pub fn from_file(path: &Path) -> Result<Self, SchedulerError> {
        let content = fs::read_to_string(path).map_err(|err| SchedulerError::ReadConfigFile {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let config = Self::from_toml_str(&content).map_err(|err| match err {
            SchedulerError::ParseConfigFile { message, .. } => SchedulerError::ParseConfigFile {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SchedulerError> {
        let config: SchedulerFileConfig =
            toml::from_str(content).map_err(|err| SchedulerError::ParseConfigFile {
                path: "<inline>".to_string(),
                message: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.ledger.validate().map_err(engine_invalid)?;
        self.contribution.validate().map_err(engine_invalid)?;
        self.scheduler.validate()?;
        // The ledger lease is renewed between transfers, so it has to outlive
        // one bounded issuer call.
        let lease_ttl_ms = u64::try_from(self.ledger.lease_ttl_ms).unwrap_or(0);
        if lease_ttl_ms <= self.scheduler.issuer_timeout_ms {
            return Err(invalid(
                "ledger.lease_ttl_ms must exceed scheduler.issuer_timeout_ms",
            ));
        }
        if self.issuer.base_url.trim().is_empty() {
            return Err(invalid("issuer.base_url cannot be empty"));
        }
        if self.issuer.request_timeout_ms == 0 || self.presence.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms must be positive"));
        }
        if self
            .presence
            .base_url
            .as_ref()
            .is_some_and(|url| url.trim().is_empty())
        {
            return Err(invalid("presence.base_url cannot be empty when set"));
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(invalid("storage.data_dir cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> SchedulerError {
    SchedulerError::InvalidConfig {
        reason: reason.to_string(),
    }
}

fn engine_invalid(err: spoils_of_war::SpoilsError) -> SchedulerError {
    SchedulerError::InvalidConfig {
        reason: err.to_string(),
    }
}
