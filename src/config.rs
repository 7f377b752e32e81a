//! File configuration for the broker and the pool
//!
//! ```yaml
//! broker:
//!   timeout: 8
//!   max_conn: 200
//!   judges:
//!     - http://httpbin.org/get?show_env
//! pool:
//!   wait_timeout: 10
//!   max_fails: 3
//! ```
//!
//! Durations are given in seconds and may be fractional. Missing keys keep
//! their defaults.

use crate::proxy::broker::BrokerConfig;
use crate::proxy::pool::PoolConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub pool: PoolConfig,
}

impl Config {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

/// Serde adapter for `Duration` as seconds
pub(crate) mod secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_config() {
        let config = Config::from_yaml_str(
            "broker:\n  timeout: 2.5\n  max_tries: 5\npool:\n  wait_timeout: 1\n",
        )
        .unwrap();

        assert_eq!(config.broker.timeout, Duration::from_millis(2500));
        assert_eq!(config.broker.max_tries, 5);
        assert_eq!(config.broker.max_conn, BrokerConfig::default().max_conn);
        assert_eq!(config.pool.wait_timeout, Duration::from_secs(1));
        assert_eq!(config.pool.max_fails, 3);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Config::from_yaml_str("pool:\n  wait_timeout: -1\n"),
            Err(crate::Error::Config(_))
        ));
        assert!(Config::from_yaml_str("broker: [1, 2]").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_yaml_file("/nonexistent/proxy-broker.yaml"),
            Err(crate::Error::Io(_))
        ));
    }
}
