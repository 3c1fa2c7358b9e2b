//! Runtime configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! TOML file, then `TEXT2SQL__SECTION__KEY` environment variables.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "text2sql-db.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TEXT2SQL";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Pool sizing and lifecycle for every per-descriptor handle
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Steady number of physical connections
    pub pool_size: u32,
    /// Extra connections allowed under load, reaped once idle
    pub max_overflow: u32,
    /// Physical connections older than this are recycled
    pub max_lifetime_secs: u64,
    /// Idle connections are closed after this long
    pub idle_timeout_secs: u64,
    /// Bound on establishing (or waiting for) a connection
    pub connect_timeout_secs: u64,
    /// Ping a pooled connection before handing it out
    pub test_before_acquire: bool,
}

impl PoolSettings {
    /// Hard cap on concurrently open physical connections
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            max_lifetime_secs: 3600,
            idle_timeout_secs: 600,
            connect_timeout_secs: 5,
            test_before_acquire: true,
        }
    }
}

/// Timeouts and retry policy for queries
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSettings {
    /// Per-statement bound for generated SQL; unset means unbounded
    #[serde(default)]
    pub statement_timeout_secs: Option<u64>,
    /// Bound on each catalog query during introspection
    pub metadata_timeout_secs: u64,
    /// Retries of catalog queries on connection errors
    pub max_retries: u32,
    /// Base backoff between retries
    pub retry_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
}

impl ExecutionSettings {
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_secs.map(Duration::from_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            statement_timeout_secs: None,
            metadata_timeout_secs: 10,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub pool: PoolSettings,
    pub execution: ExecutionSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            pool: PoolSettings::default(),
            execution: ExecutionSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment
    ///
    /// With `path == None`, [`DEFAULT_CONFIG_FILE`] is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", defaults.server.port)?
            .set_default("pool.pool_size", defaults.pool.pool_size)?
            .set_default("pool.max_overflow", defaults.pool.max_overflow)?
            .set_default("pool.max_lifetime_secs", defaults.pool.max_lifetime_secs)?
            .set_default("pool.idle_timeout_secs", defaults.pool.idle_timeout_secs)?
            .set_default("pool.connect_timeout_secs", defaults.pool.connect_timeout_secs)?
            .set_default("pool.test_before_acquire", defaults.pool.test_before_acquire)?
            .set_default(
                "execution.metadata_timeout_secs",
                defaults.execution.metadata_timeout_secs,
            )?
            .set_default("execution.max_retries", defaults.execution.max_retries)?
            .set_default(
                "execution.retry_backoff_ms",
                defaults.execution.retry_backoff_ms,
            )?
            .set_default("execution.max_backoff_ms", defaults.execution.max_backoff_ms)?;

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => {
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    builder = builder
                        .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        match settings.pool.pool_size.checked_add(settings.pool.max_overflow) {
            None => anyhow::bail!("pool.pool_size + pool.max_overflow overflows"),
            Some(0) => anyhow::bail!("pool.pool_size + pool.max_overflow must be at least 1"),
            Some(_) => {}
        }

        Ok(settings)
    }
}
