//! Relay configuration from the environment.
//!
//! Values come from `RELAY_*` variables, deserialized with `envy`. Before
//! reading them, [`RelayConfig::load`] feeds `relay.env` (or `.env` when that
//! is absent) into the process environment with `dotenvy`, without overriding
//! variables that are already set. Every field has a default except the JWT
//! secret.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;
use crate::presence::PresencePolicy;

/// Environment variable prefix, e.g. `RELAY_BIND_ADDR`.
pub const ENV_PREFIX: &str = "RELAY_";

/// Largest `update` or `sync-message` payload accepted by default (4 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Bind address (default: 127.0.0.1:9090)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// HS256 secret shared with the token issuer
    #[serde(default)]
    pub jwt_secret: String,

    /// Frames buffered per connection before it counts as lagging
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Upper bound for access checks plus document load during join
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Presence goes Idle after this long without activity
    #[serde(default = "default_idle_after_secs")]
    pub idle_after_secs: u64,

    /// Presence goes Away after this long without activity
    #[serde(default = "default_away_after_secs")]
    pub away_after_secs: u64,

    /// How long an unsubscribed document stays in memory
    #[serde(default = "default_eviction_grace_secs")]
    pub eviction_grace_secs: u64,

    /// Largest CRDT payload in one message; also caps WebSocket messages
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Snapshot directory; in-memory store when unset
    pub storage_path: Option<PathBuf>,

    /// JSON file seeding users and workspaces
    pub directory_path: Option<PathBuf>,
}

impl RelayConfig {
    /// Load from `relay.env` (or `.env`) and `RELAY_*` environment variables.
    pub fn load() -> Result<Self, RelayError> {
        if std::path::Path::new("relay.env").exists() {
            dotenvy::from_filename("relay.env").ok();
        } else {
            dotenvy::dotenv().ok();
        }

        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        log::info!("Configuration loaded (bind {})", config.bind_addr);
        Ok(config)
    }

    /// Build from explicit `(NAME, value)` pairs, names carrying the prefix.
    pub fn from_vars<I>(vars: I) -> Result<Self, RelayError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.jwt_secret.trim().is_empty() {
            return Err(RelayError::Config(format!("{ENV_PREFIX}JWT_SECRET is not set")));
        }
        if self.outbox_capacity == 0 {
            return Err(RelayError::Config("outbox_capacity must be positive".into()));
        }
        if self.join_timeout_secs == 0 {
            return Err(RelayError::Config("join_timeout_secs must be positive".into()));
        }
        if self.max_message_bytes == 0 {
            return Err(RelayError::Config("max_message_bytes must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(RelayError::Config("sweep_interval_secs must be positive".into()));
        }
        if self.away_after_secs < self.idle_after_secs {
            return Err(RelayError::Config(
                "away_after_secs must not be shorter than idle_after_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_secs)
    }

    pub fn presence_policy(&self) -> PresencePolicy {
        PresencePolicy {
            idle_after: Duration::from_secs(self.idle_after_secs),
            away_after: Duration::from_secs(self.away_after_secs),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            jwt_secret: String::new(),
            outbox_capacity: default_outbox_capacity(),
            join_timeout_secs: default_join_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_after_secs: default_idle_after_secs(),
            away_after_secs: default_away_after_secs(),
            eviction_grace_secs: default_eviction_grace_secs(),
            max_message_bytes: default_max_message_bytes(),
            storage_path: None,
            directory_path: None,
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_join_timeout_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_idle_after_secs() -> u64 {
    90
}

fn default_away_after_secs() -> u64 {
    300
}

fn default_eviction_grace_secs() -> u64 {
    30
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}
