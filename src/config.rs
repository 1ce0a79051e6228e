//! Configuration loading and normalization.
//!
//! Config is immutable once loaded. All fields carry defaults so a minimal
//! file (or none of the optional tables) still yields a runnable proxy.
//! Syntactic checks are serde's job; `normalized()` applies the semantic
//! guards afterwards.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Load-balancing strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Atomic cyclic pick.
    #[default]
    Rr,
    /// Fewest active connections.
    Lc,
    /// Power of two choices over the healthy set.
    P2c,
    /// Switches between the above by in-flight load.
    Adaptive,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Algorithm::Rr => "rr",
            Algorithm::Lc => "lc",
            Algorithm::P2c => "p2c",
            Algorithm::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

/// Global token-bucket limiter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_rate: 50.0,
            refill_interval: Duration::from_secs(1),
        }
    }
}

/// Thresholds for the adaptive balancer's three load bands.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub low_threshold: i64,
    pub high_threshold: i64,
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address, either "host:port" or ":port".
    pub listen_port: String,

    /// Upstream pool, absolute URLs including scheme.
    pub servers: Vec<String>,

    pub algorithm: Algorithm,

    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    pub rate_limiter: RateLimiterConfig,

    /// SQLite file holding per-client quotas.
    pub db_path: String,

    pub adaptive: AdaptiveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: ":8080".to_string(),
            servers: Vec::new(),
            algorithm: Algorithm::default(),
            health_check_interval: Duration::from_secs(2),
            rate_limiter: RateLimiterConfig::default(),
            db_path: "clients.db".to_string(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load configuration from a TOML file and apply semantic defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config.normalized())
    }

    /// Replace out-of-range values with their documented defaults.
    pub fn normalized(mut self) -> Self {
        if self.listen_port.is_empty() {
            self.listen_port = ":8080".to_string();
        }
        if self.db_path.is_empty() {
            tracing::info!("database path not set, using default 'clients.db'");
            self.db_path = "clients.db".to_string();
        }
        if self.health_check_interval.is_zero() {
            self.health_check_interval = Duration::from_secs(2);
        }

        let rl = &mut self.rate_limiter;
        if rl.capacity <= 0.0 {
            rl.capacity = 100.0;
        }
        if rl.refill_rate <= 0.0 {
            rl.refill_rate = 50.0;
        }
        if rl.refill_interval.is_zero() {
            rl.refill_interval = Duration::from_secs(1);
        }

        let ad = &mut self.adaptive;
        if ad.low_threshold < 0 {
            ad.low_threshold = 10;
        }
        if ad.high_threshold <= ad.low_threshold {
            ad.high_threshold = ad.low_threshold * 10;
        }

        self
    }

    /// The address to bind. A bare ":port" binds all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.listen_port.starts_with(':') {
            format!("0.0.0.0{}", self.listen_port)
        } else {
            self.listen_port.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let cfg = Config::default().normalized();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.algorithm, Algorithm::Rr);
        assert_eq!(cfg.health_check_interval, Duration::from_secs(2));
        assert_eq!(cfg.rate_limiter.capacity, 100.0);
        assert_eq!(cfg.rate_limiter.refill_rate, 50.0);
        assert_eq!(cfg.db_path, "clients.db");
    }

    #[test]
    fn parses_full_toml() {
        let cfg: Config = toml::from_str(
            r#"
            listen_port = "127.0.0.1:9000"
            servers = ["http://10.0.0.1:80", "http://10.0.0.2:80"]
            algorithm = "adaptive"
            health_check_interval = "500ms"
            db_path = "/tmp/quotas.db"

            [rate_limiter]
            capacity = 10.0
            refill_rate = 5.0
            refill_interval = "250ms"

            [adaptive]
            low_threshold = 5
            high_threshold = 10
            "#,
        )
        .unwrap();

        assert_eq!(cfg.listen_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.algorithm, Algorithm::Adaptive);
        assert_eq!(cfg.health_check_interval, Duration::from_millis(500));
        assert_eq!(cfg.rate_limiter.refill_interval, Duration::from_millis(250));
        assert_eq!(cfg.adaptive.low_threshold, 5);
    }

    #[test]
    fn unknown_algorithm_is_a_parse_error() {
        let res: Result<Config, _> = toml::from_str(r#"algorithm = "fastest""#);
        assert!(res.is_err());
    }

    #[test]
    fn normalization_replaces_bad_values() {
        let cfg: Config = toml::from_str(
            r#"
            [rate_limiter]
            capacity = -1.0
            refill_rate = 0.0
            refill_interval = "0s"

            [adaptive]
            low_threshold = -3
            high_threshold = 2
            "#,
        )
        .unwrap();
        let cfg = cfg.normalized();

        assert_eq!(cfg.rate_limiter.capacity, 100.0);
        assert_eq!(cfg.rate_limiter.refill_rate, 50.0);
        assert_eq!(cfg.rate_limiter.refill_interval, Duration::from_secs(1));
        assert_eq!(cfg.adaptive.low_threshold, 10);
        assert_eq!(cfg.adaptive.high_threshold, 100);
    }

    #[test]
    fn adaptive_high_must_exceed_low() {
        let cfg: Config = toml::from_str(
            r#"
            [adaptive]
            low_threshold = 7
            high_threshold = 7
            "#,
        )
        .unwrap();
        let cfg = cfg.normalized();
        assert_eq!(cfg.adaptive.low_threshold, 7);
        assert_eq!(cfg.adaptive.high_threshold, 70);
    }
}
