use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::AppResult;
use crate::settlement::SchedulerConfig;

/// Runtime configuration.
///
/// Sources, lowest precedence first: built-in defaults, an optional
/// `sweeper.toml` (or the file named by `SWEEPER_CONFIG`), then
/// `SWEEPER__*` environment variables, e.g.
/// `SWEEPER__NETWORKS__MAINNET__RPC_URL`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub networks: HashMap<String, NetworkSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    #[serde(default = "default_interval_secs")]
    pub verify_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub transfer_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_max_concurrent_owners")]
    pub max_concurrent_owners: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            verify_interval_secs: default_interval_secs(),
            transfer_interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_concurrent_owners: default_max_concurrent_owners(),
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            verify_interval: Duration::from_secs(settings.verify_interval_secs.max(1)),
            transfer_interval: Duration::from_secs(settings.transfer_interval_secs.max(1)),
        }
    }
}

/// One ledger network. Transfers additionally need `delegate_keypair`
/// and `destination`.
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    pub rpc_url: String,
    /// Keypair bytes as a JSON array, or a path to a keypair file holding one
    pub delegate_keypair: Option<String>,
    pub destination: Option<String>,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_pending_expiry_secs")]
    pub pending_expiry_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> i64 {
    100
}

fn default_max_concurrent_owners() -> usize {
    1
}

fn default_confirmation_timeout_secs() -> u64 {
    60
}

fn default_pending_expiry_secs() -> u64 {
    180
}

impl Config {
    pub fn load() -> AppResult<Self> {
        let path = std::env::var("SWEEPER_CONFIG").unwrap_or_else(|_| "sweeper".to_string());
        Self::from_sources(config::File::with_name(&path).required(false))
    }

    fn from_sources<S>(file: S) -> AppResult<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/sweeper".to_string());

        let config = config::Config::builder()
            .set_default("database_url", database_url)?
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("SWEEPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
