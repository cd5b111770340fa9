//! Server configuration
//!
//! Typed settings with environment-variable overrides. Validation failures
//! are fatal at startup; everything after that treats the config as
//! read-only. Config-file loading is intentionally absent.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::VersionSelector;

/// One `name:selector` preload entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadSpec {
    pub name: String,
    pub selector: VersionSelector,
}

impl FromStr for PreloadSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::BadPreloadEntry(s.to_string()));
        }
        let (name, selector) = match s.split_once(':') {
            Some((name, selector)) if !name.is_empty() && !selector.is_empty() => (
                name.to_string(),
                selector.parse().expect("selector parse is infallible"),
            ),
            // A bare name tracks whatever is in production.
            None => (s.to_string(), VersionSelector::Alias("production".into())),
            Some(_) => return Err(ConfigError::BadPreloadEntry(s.to_string())),
        };
        Ok(PreloadSpec { name, selector })
    }
}

/// Full server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// host:port the HTTP listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Seconds between registry reconciliation ticks. Minimum 5.
    #[serde(default = "default_poller_interval")]
    pub poller_interval_seconds: u64,

    /// Fractional jitter applied to each tick.
    #[serde(default = "default_poller_jitter")]
    pub poller_jitter_fraction: f64,

    #[serde(default = "default_prediction_cache_capacity")]
    pub prediction_cache_capacity: usize,

    #[serde(default = "default_prediction_cache_ttl")]
    pub prediction_cache_ttl_seconds: u64,

    #[serde(default = "default_feature_cache_capacity")]
    pub feature_cache_capacity: usize,

    #[serde(default = "default_feature_cache_ttl")]
    pub feature_cache_ttl_seconds: u64,

    /// How long a retired handle stays reachable after a swap.
    #[serde(default = "default_drain_window")]
    pub model_drain_window_seconds: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Models loaded at startup, as `name:version` or `name:alias` entries.
    #[serde(default)]
    pub preload_models: Vec<String>,

    /// Bound on concurrently admitted requests.
    #[serde(default = "default_request_queue_capacity")]
    pub request_queue_capacity: usize,

    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_seconds: u64,

    /// Upper bound on startup preloading.
    #[serde(default = "default_warmup_deadline")]
    pub warmup_deadline_seconds: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_poller_interval() -> u64 {
    60
}

fn default_poller_jitter() -> f64 {
    0.1
}

fn default_prediction_cache_capacity() -> usize {
    10_000
}

fn default_prediction_cache_ttl() -> u64 {
    300
}

fn default_feature_cache_capacity() -> usize {
    100_000
}

fn default_feature_cache_ttl() -> u64 {
    3600
}

fn default_drain_window() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_request_queue_capacity() -> usize {
    1024
}

fn default_shutdown_deadline() -> u64 {
    30
}

fn default_warmup_deadline() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            poller_interval_seconds: default_poller_interval(),
            poller_jitter_fraction: default_poller_jitter(),
            prediction_cache_capacity: default_prediction_cache_capacity(),
            prediction_cache_ttl_seconds: default_prediction_cache_ttl(),
            feature_cache_capacity: default_feature_cache_capacity(),
            feature_cache_ttl_seconds: default_feature_cache_ttl(),
            model_drain_window_seconds: default_drain_window(),
            request_timeout_ms: default_request_timeout(),
            preload_models: Vec::new(),
            request_queue_capacity: default_request_queue_capacity(),
            shutdown_deadline_seconds: default_shutdown_deadline(),
            warmup_deadline_seconds: default_warmup_deadline(),
        }
    }
}

impl Config {
    /// Build from `MLSERVE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        read_env("MLSERVE_LISTEN_ADDR", &mut config.listen_addr)?;
        read_env(
            "MLSERVE_POLLER_INTERVAL_SECONDS",
            &mut config.poller_interval_seconds,
        )?;
        read_env(
            "MLSERVE_POLLER_JITTER_FRACTION",
            &mut config.poller_jitter_fraction,
        )?;
        read_env(
            "MLSERVE_PREDICTION_CACHE_CAPACITY",
            &mut config.prediction_cache_capacity,
        )?;
        read_env(
            "MLSERVE_PREDICTION_CACHE_TTL_SECONDS",
            &mut config.prediction_cache_ttl_seconds,
        )?;
        read_env(
            "MLSERVE_FEATURE_CACHE_CAPACITY",
            &mut config.feature_cache_capacity,
        )?;
        read_env(
            "MLSERVE_FEATURE_CACHE_TTL_SECONDS",
            &mut config.feature_cache_ttl_seconds,
        )?;
        read_env(
            "MLSERVE_MODEL_DRAIN_WINDOW_SECONDS",
            &mut config.model_drain_window_seconds,
        )?;
        read_env("MLSERVE_REQUEST_TIMEOUT_MS", &mut config.request_timeout_ms)?;
        read_env(
            "MLSERVE_REQUEST_QUEUE_CAPACITY",
            &mut config.request_queue_capacity,
        )?;
        read_env(
            "MLSERVE_SHUTDOWN_DEADLINE_SECONDS",
            &mut config.shutdown_deadline_seconds,
        )?;
        read_env(
            "MLSERVE_WARMUP_DEADLINE_SECONDS",
            &mut config.warmup_deadline_seconds,
        )?;
        if let Ok(raw) = std::env::var("MLSERVE_PRELOAD_MODELS") {
            config.preload_models = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.poller_interval_seconds < 5 {
            return Err(ConfigError::Invalid {
                key: "poller_interval_seconds",
                reason: format!("{} is below the minimum of 5", self.poller_interval_seconds),
            });
        }
        if !(0.0..=0.9).contains(&self.poller_jitter_fraction) {
            return Err(ConfigError::Invalid {
                key: "poller_jitter_fraction",
                reason: format!("{} is outside [0.0, 0.9]", self.poller_jitter_fraction),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.request_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "request_queue_capacity",
                reason: "must be positive".into(),
            });
        }
        self.preload_specs()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr.parse().map_err(|_| ConfigError::Invalid {
            key: "listen_addr",
            reason: format!("'{}' is not host:port", self.listen_addr),
        })
    }

    pub fn preload_specs(&self) -> Result<Vec<PreloadSpec>, ConfigError> {
        self.preload_models.iter().map(|s| s.parse()).collect()
    }

    pub fn poller_interval(&self) -> Duration {
        Duration::from_secs(self.poller_interval_seconds)
    }

    pub fn prediction_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.prediction_cache_ttl_seconds)
    }

    pub fn feature_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.feature_cache_ttl_seconds)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.model_drain_window_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_seconds)
    }

    pub fn warmup_deadline(&self) -> Duration {
        Duration::from_secs(self.warmup_deadline_seconds)
    }
}

fn read_env<T: FromStr>(key: &'static str, slot: &mut T) -> Result<(), ConfigError> {
    match std::env::var(key) {
        Ok(raw) => {
            *slot = raw.parse().map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("could not parse '{raw}'"),
            })?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.poller_interval_seconds, 60);
        assert_eq!(config.prediction_cache_capacity, 10_000);
        assert_eq!(config.request_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn rejects_short_poll_interval() {
        let config = Config {
            poller_interval_seconds: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "poller_interval_seconds",
                ..
            })
        ));
    }

    #[test]
    fn rejects_unparsable_listen_addr() {
        let config = Config {
            listen_addr: "nowhere".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn preload_entries_parse() {
        let spec: PreloadSpec = "fraud_detector:production".parse().unwrap();
        assert_eq!(spec.name, "fraud_detector");
        assert_eq!(spec.selector, VersionSelector::Alias("production".into()));

        let spec: PreloadSpec = "fraud_detector:3".parse().unwrap();
        assert_eq!(spec.selector, VersionSelector::Version(3));

        let spec: PreloadSpec = "fraud_detector".parse().unwrap();
        assert_eq!(spec.selector, VersionSelector::Alias("production".into()));

        assert!("fraud_detector:".parse::<PreloadSpec>().is_err());
        assert!(":3".parse::<PreloadSpec>().is_err());
    }

    #[test]
    fn serde_defaults_fill_missing_keys() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.feature_cache_capacity, 100_000);
    }
}
