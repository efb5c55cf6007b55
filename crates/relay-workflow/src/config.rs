use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_pty::{DEFAULT_IDLE_THRESHOLD, DEFAULT_MAX_VERIFICATION_ATTEMPTS, DEFAULT_VERIFICATION_WINDOW};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Broker/runtime tunables (§4.2, §4.3, §4.6, §4.8), loaded from an
/// optional TOML file and overridden by CLI flags — the same override
/// order the CLI surface this project's worker-pool logic is grounded on
/// already applies to its own flags, generalized to a config-file layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(with = "duration_secs")]
    pub idle_threshold: Duration,
    #[serde(with = "duration_secs")]
    pub verification_window: Duration,
    pub max_verification_attempts: u32,
    /// Wave size cap for the workflow scheduler. `None` is unbounded (§4.8
    /// default).
    pub max_concurrency: Option<usize>,
    /// Grace window given to a cancelled step's child process between a
    /// graceful signal and a forceful one (§5).
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
    /// Inbound-gateway dedup window (§4.7).
    #[serde(with = "duration_secs")]
    pub dedup_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            verification_window: DEFAULT_VERIFICATION_WINDOW,
            max_verification_attempts: DEFAULT_MAX_VERIFICATION_ATTEMPTS,
            max_concurrency: None,
            shutdown_grace: Duration::from_secs(5),
            dedup_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pty_crate_constants() {
        let config = RelayConfig::default();
        assert_eq!(config.idle_threshold, DEFAULT_IDLE_THRESHOLD);
        assert_eq!(config.max_concurrency, None);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = RelayConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: RelayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.idle_threshold, config.idle_threshold);
    }
}
