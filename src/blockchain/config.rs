use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::Path;
use std::time::Duration;

use super::pow::difficulty_prefix;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Leading bytes every block hash must carry
    pub pow_prefix: Vec<u8>,

    /// How long the miner rests when idle or after submitting a block
    pub tx_poll_interval_ms: u64,

    /// Capacity of the inbound transaction and block queues
    pub queue_capacity: usize,

    /// Whether this node mines blocks or only validates and relays them
    pub mining: bool,

    /// Blocks held back while their predecessors are fetched
    pub max_pending_blocks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pow_prefix: difficulty_prefix(2),
            tx_poll_interval_ms: 10_000,
            queue_capacity: 256,
            mining: true,
            max_pending_blocks: 64,
        }
    }
}

impl Config {
    /// Loads a JSON config file. Missing fields take their default.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tx_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tx_poll_interval_ms)
    }

    /// Sets the proof of work prefix to `len` zero bytes
    pub fn with_difficulty(mut self, len: usize) -> Self {
        self.pow_prefix = difficulty_prefix(len);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pow_prefix, vec![0, 0]);
        assert_eq!(config.tx_poll_interval(), Duration::from_secs(10));
        assert!(config.mining);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "mining": false, "tx_poll_interval_ms": 50 }"#).unwrap();
        assert!(!config.mining);
        assert_eq!(config.tx_poll_interval(), Duration::from_millis(50));
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "pow_prefix": [0] }"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config, Config::default().with_difficulty(1));

        assert!(matches!(
            Config::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            Config::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_queue_capacity_is_rejected() {
        assert!(matches!(
            Config::from_json(r#"{ "queue_capacity": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));

        let config = Config {
            queue_capacity: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
