//! Environment-driven configuration.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;
use crate::sync::projection::DEFAULT_META_DEBOUNCE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Which repository backs the update log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sled,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(()),
        }
    }
}

/// Per-document actor tuning
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Quiet period before the `meta` map is written to the record
    pub meta_debounce: Duration,
    /// How long an actor with no observers stays alive
    pub idle_timeout: Duration,
    /// Compact the update log when the actor terminates
    pub compact_on_shutdown: bool,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            meta_debounce: DEFAULT_META_DEBOUNCE,
            idle_timeout: Duration::from_secs(30),
            compact_on_shutdown: true,
        }
    }
}

impl ActorConfig {
    pub fn with_meta_debounce(mut self, delay: Duration) -> Self {
        self.meta_debounce = delay;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_compact_on_shutdown(mut self, compact: bool) -> Self {
        self.compact_on_shutdown = compact;
        self
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_backend: StorageBackend,
    pub storage: StorageConfig,
    pub actor: ActorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage_backend: StorageBackend::Sled,
            storage: StorageConfig::default(),
            actor: ActorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ServerConfig::default();

        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(backend) = lookup("STORAGE_BACKEND") {
            config.storage_backend = backend.parse().map_err(|_| ConfigError::Invalid {
                name: "STORAGE_BACKEND",
                value: backend.clone(),
            })?;
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage = StorageConfig::new(path);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "META_DEBOUNCE_MS")? {
            config.actor.meta_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "ACTOR_IDLE_TIMEOUT_SECS")? {
            config.actor.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(compact) = parse_var(&lookup, "COMPACT_ON_SHUTDOWN")? {
            config.actor.compact_on_shutdown = compact;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.storage_backend, StorageBackend::Sled);
        assert_eq!(config.storage.path, "./data/docs.sled");
        assert_eq!(config.actor.meta_debounce, Duration::from_millis(500));
        assert_eq!(config.actor.idle_timeout, Duration::from_secs(30));
        assert!(config.actor.compact_on_shutdown);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("STORAGE_BACKEND", "Memory"),
            ("STORAGE_PATH", "/tmp/x.sled"),
            ("META_DEBOUNCE_MS", "250"),
            ("ACTOR_IDLE_TIMEOUT_SECS", "5"),
            ("COMPACT_ON_SHUTDOWN", "false"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.storage.path, "/tmp/x.sled");
        assert_eq!(config.actor.meta_debounce, Duration::from_millis(250));
        assert_eq!(config.actor.idle_timeout, Duration::from_secs(5));
        assert!(!config.actor.compact_on_shutdown);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for PORT: eighty");

        assert!(ServerConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "postgres")])).is_err());
    }
}
