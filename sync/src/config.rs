//! Configuration management for the sync daemon.

use crate::auth::Credentials;
use crate::collections;
use ferry_engine::{CollectionSchema, MergeStrategy, RecoveryMode};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Sync configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// CouchDB base URL, e.g. `https://couch.example.com`
    pub remote_url: String,
    /// Prefix of the per-user database names
    pub db_prefix: String,
    /// Delay between replication cycles
    pub pull_interval: Duration,
    /// Documents per pull or push request
    pub batch_size: usize,
    /// Directory holding local stores
    pub store_dir: PathBuf,
    pub store_name: String,
    pub recovery_mode: RecoveryMode,
    pub user_id: String,
    pub credentials: Credentials,
    /// Passphrase for at-rest field encryption
    pub store_password: Option<String>,
    /// Collections to open and replicate; every default collection when
    /// empty
    pub collections: Vec<String>,
    /// Server admin used to create and secure the user's databases
    pub admin_credentials: Option<Credentials>,
    pub merge_strategy: MergeStrategy,
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Schemas of the configured collections.
    pub fn schemas(&self) -> Result<Vec<CollectionSchema>, ConfigError> {
        collections::resolve(&self.collections)
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let remote_url = var("FERRY_REMOTE_URL").ok_or(ConfigError::MissingRemoteUrl)?;
        let db_prefix = var("FERRY_DB_PREFIX").unwrap_or_else(|| "userdb".to_string());

        let pull_interval = Duration::from_secs(parse_number(&var, "FERRY_PULL_INTERVAL_SECS", 10)?);
        let batch_size = parse_number(&var, "FERRY_BATCH_SIZE", 60)? as usize;
        if batch_size == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "FERRY_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        let store_dir = PathBuf::from(var("FERRY_STORE_DIR").unwrap_or_else(|| "./ferry-data".to_string()));
        let store_name = var("FERRY_STORE_NAME").unwrap_or_else(|| "kernel_db".to_string());

        let recovery_mode = match var("FERRY_RECOVERY_MODE") {
            Some(mode) => mode.parse().map_err(ConfigError::InvalidRecoveryMode)?,
            None => RecoveryMode::default(),
        };
        let merge_strategy = match var("FERRY_MERGE_STRATEGY") {
            Some(strategy) => strategy.parse().map_err(ConfigError::InvalidMergeStrategy)?,
            None => MergeStrategy::default(),
        };

        let username = var("FERRY_USERNAME");
        let credentials = match (var("FERRY_TOKEN"), username.clone(), var("FERRY_PASSWORD")) {
            (Some(token), _, _) => Credentials::static_token(token),
            (None, Some(username), Some(password)) => Credentials::basic(username, password),
            (None, Some(_), None) => return Err(ConfigError::IncompleteCredentials("FERRY_USERNAME")),
            (None, None, _) => Credentials::None,
        };

        let admin_credentials = match (var("FERRY_ADMIN_USERNAME"), var("FERRY_ADMIN_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials::basic(username, password)),
            (Some(_), None) => {
                return Err(ConfigError::IncompleteCredentials("FERRY_ADMIN_USERNAME"))
            }
            _ => None,
        };

        let user_id = var("FERRY_USER_ID")
            .or(username)
            .ok_or(ConfigError::MissingUserId)?;

        let collections = var("FERRY_COLLECTIONS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            remote_url,
            db_prefix,
            pull_interval,
            batch_size,
            store_dir,
            store_name,
            recovery_mode,
            user_id,
            credentials,
            store_password: var("FERRY_STORE_PASSWORD"),
            collections,
            admin_credentials,
            merge_strategy,
        })
    }
}

fn parse_number<F>(var: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidNumber { var: key, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("FERRY_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,

    #[error("FERRY_USER_ID (or FERRY_USERNAME) environment variable is required")]
    MissingUserId,

    #[error("Invalid {var} value: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("Invalid FERRY_RECOVERY_MODE: {0}")]
    InvalidRecoveryMode(String),

    #[error("Invalid FERRY_MERGE_STRATEGY: {0}")]
    InvalidMergeStrategy(String),

    #[error("{0} is set without a matching password")]
    IncompleteCredentials(&'static str),

    #[error("Unknown collection in FERRY_COLLECTIONS: {0}")]
    UnknownCollection(String),
}
