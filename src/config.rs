//! Service configuration.
//!
//! Loaded from a JSON file with PascalCase keys. Every field has a default,
//! so an empty object is a valid Standalone configuration. Validation is
//! explicit via [`ServiceConfig::validate`] and names the offending field;
//! both role constructors call it, so a misconfigured service refuses to
//! start instead of limping.
//!
//! ```json
//! {
//!     "ListenEndpoint": "0.0.0.0:5000",
//!     "Mode": "Standalone",
//!     "MatchmakerThreads": 2,
//!     "UseRedis": false,
//!     "MaxDowntimeBeforeOffline": 10.0,
//!     "MatchmakerUpdateDelay": 1.0,
//!     "DirectorUpdateDelay": 1.0,
//!     "MatchmakerMinGatherTime": 2.0,
//!     "MatchmakerPoolCapacity": 10000,
//!     "MaxMatchFailures": 10
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_DIRECTOR_UPDATE_DELAY_SECS, DEFAULT_LISTEN_ENDPOINT, DEFAULT_MATCHMAKER_UPDATE_DELAY_SECS,
    DEFAULT_MAX_DOWNTIME_SECS, DEFAULT_MAX_MATCH_FAILURES, DEFAULT_MIN_GATHER_SECS,
    DEFAULT_POOL_CAPACITY, MAX_MATCHMAKER_THREADS, MIN_MATCHMAKER_THREADS, MIN_MAX_DOWNTIME_SECS,
    MIN_POOL_CAPACITY, MIN_UPDATE_DELAY_SECS,
};
use crate::error::{Error, Result};

/// Which role(s) this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Director and Matchmaker in one process, in-memory state by default.
    #[default]
    Standalone,
    /// Matchmaker role only. Requires Redis.
    Matchmaker,
    /// Director role only. Requires Redis.
    Director,
}

/// Recognized configuration options and their effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceConfig {
    /// Endpoint the RPC layer binds.
    pub listen_endpoint: String,

    /// TLS certificate path; TLS is enabled when both paths resolve. The
    /// RPC layer owns termination, this crate only carries the setting.
    pub certificate_path: Option<String>,

    /// TLS private key path.
    pub private_key_path: Option<String>,

    pub mode: Mode,

    /// Matchmaker worker count, 1..=128.
    pub matchmaker_threads: usize,

    /// Use the Redis state backend. Forced on by non-Standalone modes.
    pub use_redis: bool,

    /// Redis connection string.
    pub redis_configuration_options: String,

    /// Seconds before a silent role is considered offline. Doubles as the
    /// Director leader-lease TTL and the matchmaker status TTL.
    pub max_downtime_before_offline: f64,

    /// Seconds between matchmaker pinger/fetcher iterations.
    pub matchmaker_update_delay: f64,

    /// Seconds between Director main-loop iterations.
    pub director_update_delay: f64,

    /// Seconds a worker waits in the gather phase.
    pub matchmaker_min_gather_time: f64,

    /// Per-pool snapshot capacity of one matching round.
    pub matchmaker_pool_capacity: usize,

    /// Failed rounds before a ticket is consumed unmatched.
    pub max_match_failures: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen_endpoint: DEFAULT_LISTEN_ENDPOINT.to_string(),
            certificate_path: None,
            private_key_path: None,
            mode: Mode::Standalone,
            matchmaker_threads: default_threads(),
            use_redis: false,
            redis_configuration_options: "redis://127.0.0.1:6379/".to_string(),
            max_downtime_before_offline: DEFAULT_MAX_DOWNTIME_SECS,
            matchmaker_update_delay: DEFAULT_MATCHMAKER_UPDATE_DELAY_SECS,
            director_update_delay: DEFAULT_DIRECTOR_UPDATE_DELAY_SECS,
            matchmaker_min_gather_time: DEFAULT_MIN_GATHER_SECS,
            matchmaker_pool_capacity: DEFAULT_POOL_CAPACITY,
            max_match_failures: DEFAULT_MAX_MATCH_FAILURES,
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
        .min(2)
}

impl ServiceConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServiceConfig =
            serde_json::from_str(&raw).map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every constraint; the error names the offending field.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_MATCHMAKER_THREADS..=MAX_MATCHMAKER_THREADS).contains(&self.matchmaker_threads) {
            return Err(Error::Config(format!(
                "MatchmakerThreads must be within {MIN_MATCHMAKER_THREADS}..={MAX_MATCHMAKER_THREADS}, got {}",
                self.matchmaker_threads
            )));
        }
        if self.max_downtime_before_offline < MIN_MAX_DOWNTIME_SECS {
            return Err(Error::Config(format!(
                "MaxDowntimeBeforeOffline must be at least {MIN_MAX_DOWNTIME_SECS}s, got {}",
                self.max_downtime_before_offline
            )));
        }
        if self.matchmaker_update_delay < MIN_UPDATE_DELAY_SECS {
            return Err(Error::Config(format!(
                "MatchmakerUpdateDelay must be at least {MIN_UPDATE_DELAY_SECS}s, got {}",
                self.matchmaker_update_delay
            )));
        }
        if self.director_update_delay < MIN_UPDATE_DELAY_SECS {
            return Err(Error::Config(format!(
                "DirectorUpdateDelay must be at least {MIN_UPDATE_DELAY_SECS}s, got {}",
                self.director_update_delay
            )));
        }
        if self.max_downtime_before_offline <= self.matchmaker_update_delay
            || self.max_downtime_before_offline <= self.director_update_delay
        {
            return Err(Error::Config(
                "MaxDowntimeBeforeOffline must exceed both update delays".to_string(),
            ));
        }
        if self.matchmaker_min_gather_time < 0.0 {
            return Err(Error::Config(format!(
                "MatchmakerMinGatherTime must not be negative, got {}",
                self.matchmaker_min_gather_time
            )));
        }
        if self.matchmaker_pool_capacity < MIN_POOL_CAPACITY {
            return Err(Error::Config(format!(
                "MatchmakerPoolCapacity must be at least {MIN_POOL_CAPACITY}, got {}",
                self.matchmaker_pool_capacity
            )));
        }
        if self.max_match_failures == 0 {
            return Err(Error::Config("MaxMatchFailures must be positive".to_string()));
        }
        Ok(())
    }

    /// Whether this configuration requires the Redis backend.
    ///
    /// Separate processes can only meet through Redis, so non-Standalone
    /// modes force it regardless of the `UseRedis` flag.
    pub fn requires_redis(&self) -> bool {
        self.use_redis || self.mode != Mode::Standalone
    }

    /// Whether TLS is enabled (both paths configured).
    pub fn tls_enabled(&self) -> bool {
        self.certificate_path.is_some() && self.private_key_path.is_some()
    }

    pub fn max_downtime(&self) -> Duration {
        Duration::from_secs_f64(self.max_downtime_before_offline)
    }

    pub fn matchmaker_delay(&self) -> Duration {
        Duration::from_secs_f64(self.matchmaker_update_delay)
    }

    pub fn director_delay(&self) -> Duration {
        Duration::from_secs_f64(self.director_update_delay)
    }

    pub fn min_gather_time(&self) -> Duration {
        Duration::from_secs_f64(self.matchmaker_min_gather_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_endpoint, "0.0.0.0:5000");
        assert_eq!(config.mode, Mode::Standalone);
        assert!(!config.requires_redis());
        assert!(!config.tls_enabled());
        assert!((1..=2).contains(&config.matchmaker_threads));
    }

    #[test]
    fn test_empty_json_is_a_valid_config() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pascal_case_keys() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "ListenEndpoint": "127.0.0.1:6000",
                "Mode": "Matchmaker",
                "MatchmakerThreads": 8,
                "MaxDowntimeBeforeOffline": 5.0,
                "MatchmakerUpdateDelay": 0.5,
                "DirectorUpdateDelay": 0.25
            }"#,
        )
        .unwrap();
        assert_eq!(config.listen_endpoint, "127.0.0.1:6000");
        assert_eq!(config.mode, Mode::Matchmaker);
        assert_eq!(config.matchmaker_threads, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_standalone_forces_redis() {
        let mut config = ServiceConfig {
            mode: Mode::Director,
            use_redis: false,
            ..Default::default()
        };
        assert!(config.requires_redis());
        config.mode = Mode::Standalone;
        assert!(!config.requires_redis());
        config.use_redis = true;
        assert!(config.requires_redis());
    }

    #[test]
    fn test_thread_bounds() {
        let mut config = ServiceConfig::default();
        config.matchmaker_threads = 0;
        assert!(config.validate().is_err());
        config.matchmaker_threads = 129;
        assert!(config.validate().is_err());
        config.matchmaker_threads = 128;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_downtime_must_exceed_delays() {
        let config = ServiceConfig {
            max_downtime_before_offline: 1.0,
            director_update_delay: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            max_downtime_before_offline: 1.0,
            matchmaker_update_delay: 2.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_delay_minimums() {
        let config = ServiceConfig {
            matchmaker_update_delay: 0.001,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            director_update_delay: 0.001,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gather_time_and_capacity_bounds() {
        let config = ServiceConfig {
            matchmaker_min_gather_time: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            matchmaker_pool_capacity: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            max_match_failures: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_requires_both_paths() {
        let config = ServiceConfig {
            certificate_path: Some("/certs/tls.crt".to_string()),
            ..Default::default()
        };
        assert!(!config.tls_enabled());

        let config = ServiceConfig {
            certificate_path: Some("/certs/tls.crt".to_string()),
            private_key_path: Some("/certs/tls.key".to_string()),
            ..Default::default()
        };
        assert!(config.tls_enabled());
    }
}
