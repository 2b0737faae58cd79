use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::shared::base::ensure_positive;
use crate::shared::{ResilienceConfig, ValidationError};

const fn default_max_connections() -> u32 {
    DestinationConfig::DEFAULT_MAX_CONNECTIONS
}

fn default_postgres_acquire_timeout_ms() -> u64 {
    PostgresSinkConfig::DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_fetch_size() -> usize {
    Neo4jSinkConfig::DEFAULT_FETCH_SIZE
}

fn default_neo4j_acquire_timeout_ms() -> u64 {
    Neo4jSinkConfig::DEFAULT_ACQUIRE_TIMEOUT_MS
}

/// Relational sink backed by a Postgres connection pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSinkConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<SecretString>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Deadline for checking a connection out of the pool.
    #[serde(default = "default_postgres_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl PostgresSinkConfig {
    pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Graph sink backed by a Neo4j bolt driver.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jSinkConfig {
    /// Bolt uri, for example `neo4j:7687`.
    pub uri: String,
    pub username: String,
    pub password: SecretString,
    /// Target database. The server default database is used when unset.
    pub database: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_neo4j_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Rows pulled per round trip when streaming results.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Neo4jSinkConfig {
    pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 60_000;
    pub const DEFAULT_FETCH_SIZE: usize = 200;

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Sink a loader writes batches to.
///
/// This intentionally does not implement [`Serialize`] to avoid accidentally
/// leaking secrets in the config into serialized forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationConfig {
    /// In-process sink, useful for local runs.
    Memory,
    Postgres(PostgresSinkConfig),
    Neo4j(Neo4jSinkConfig),
}

impl DestinationConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;

    /// Size of the sink connection pool, or `None` for sinks without one.
    pub fn max_connections(&self) -> Option<u32> {
        match self {
            DestinationConfig::Memory => None,
            DestinationConfig::Postgres(config) => Some(config.max_connections),
            DestinationConfig::Neo4j(config) => Some(config.max_connections),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            DestinationConfig::Memory => Ok(()),
            DestinationConfig::Postgres(config) => {
                ensure_positive("destination.postgres.max_connections", config.max_connections as u64)?;
                ensure_positive("destination.postgres.acquire_timeout_ms", config.acquire_timeout_ms)?;
                config.resilience.validate()
            }
            DestinationConfig::Neo4j(config) => {
                ensure_positive("destination.neo4j.max_connections", config.max_connections as u64)?;
                ensure_positive("destination.neo4j.acquire_timeout_ms", config.acquire_timeout_ms)?;
                ensure_positive("destination.neo4j.fetch_size", config.fetch_size as u64)?;
                config.resilience.validate()
            }
        }
    }
}

/// Loggable view of [`DestinationConfig`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationConfigWithoutSecrets {
    Memory,
    Postgres {
        host: String,
        port: u16,
        database: String,
        username: String,
        max_connections: u32,
    },
    Neo4j {
        uri: String,
        username: String,
        database: Option<String>,
        max_connections: u32,
    },
}

impl From<DestinationConfig> for DestinationConfigWithoutSecrets {
    fn from(value: DestinationConfig) -> Self {
        match value {
            DestinationConfig::Memory => DestinationConfigWithoutSecrets::Memory,
            DestinationConfig::Postgres(config) => DestinationConfigWithoutSecrets::Postgres {
                host: config.host,
                port: config.port,
                database: config.database,
                username: config.username,
                max_connections: config.max_connections,
            },
            DestinationConfig::Neo4j(config) => DestinationConfigWithoutSecrets::Neo4j {
                uri: config.uri,
                username: config.username,
                database: config.database,
                max_connections: config.max_connections,
            },
        }
    }
}
