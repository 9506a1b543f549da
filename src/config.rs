//! Startup configuration: attack mode, shaper parameters and addresses.
//!
//! Everything here is resolved once, validated, then shared read-only behind
//! an `Arc` by the listener, every session and every shaper.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{ProxyError, Result};

pub const DEFAULT_DELAY_MIN: f64 = 2.0;
pub const DEFAULT_DELAY_MAX: f64 = 10.0;
pub const DEFAULT_DROP_RATE: f64 = 0.3;
pub const DEFAULT_REORDER_WINDOW: usize = 5;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest delay a chunk may be held in random-delay mode, in seconds (one day).
pub const MAX_DELAY_SECS: f64 = 86_400.0;

/// Impairment applied to every chunk relayed by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttackMode {
    #[default]
    Transparent,
    RandomDelay,
    Drop,
    Reorder,
}

impl AttackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackMode::Transparent => "transparent",
            AttackMode::RandomDelay => "random_delay",
            AttackMode::Drop => "drop",
            AttackMode::Reorder => "reorder",
        }
    }

    /// Unknown names degrade to `Transparent` with a warning instead of
    /// failing startup.
    pub fn from_name_or_default(name: &str) -> Self {
        match name.parse() {
            Ok(mode) => mode,
            Err(_) => {
                warn!("Invalid mode '{}', defaulting to transparent", name);
                AttackMode::Transparent
            }
        }
    }
}

impl fmt::Display for AttackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "transparent" => Ok(AttackMode::Transparent),
            "random_delay" => Ok(AttackMode::RandomDelay),
            "drop" => Ok(AttackMode::Drop),
            "reorder" => Ok(AttackMode::Reorder),
            other => Err(ProxyError::config(format!("unknown attack mode '{}'", other))),
        }
    }
}

/// Numeric parameters consumed by the stream shaper.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaperConfig {
    pub mode: AttackMode,
    /// Lower bound of the random delay, in seconds.
    pub delay_min: f64,
    /// Upper bound of the random delay, in seconds.
    pub delay_max: f64,
    /// Probability in `[0, 1]` that a chunk is discarded.
    pub drop_rate: f64,
    /// Number of chunks held before one is released in reorder mode.
    pub reorder_window: usize,
    /// Maximum bytes read per receive call.
    pub chunk_size: usize,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            mode: AttackMode::Transparent,
            delay_min: DEFAULT_DELAY_MIN,
            delay_max: DEFAULT_DELAY_MAX,
            drop_rate: DEFAULT_DROP_RATE,
            reorder_window: DEFAULT_REORDER_WINDOW,
            chunk_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ShaperConfig {
    pub fn with_mode(mode: AttackMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.delay_min.is_finite() || !self.delay_max.is_finite() {
            return Err(ProxyError::config("delay bounds must be finite"));
        }
        if self.delay_min < 0.0 {
            return Err(ProxyError::config("delay_min cannot be negative"));
        }
        if self.delay_min > self.delay_max {
            return Err(ProxyError::config(format!(
                "delay_min ({}) must not exceed delay_max ({})",
                self.delay_min, self.delay_max
            )));
        }
        if self.delay_max > MAX_DELAY_SECS {
            return Err(ProxyError::config(format!(
                "delay_max ({}) must not exceed {} seconds",
                self.delay_max, MAX_DELAY_SECS
            )));
        }
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(ProxyError::config(format!(
                "drop_rate must be within [0, 1], got {}",
                self.drop_rate
            )));
        }
        if self.reorder_window == 0 {
            return Err(ProxyError::config("reorder_window must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(ProxyError::config("buffer_size must be at least 1"));
        }
        Ok(())
    }
}

/// Complete runtime configuration for one proxy process.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub server_host: String,
    pub server_port: u16,
    pub shaper: ShaperConfig,
    pub connect_timeout: Duration,
    /// `None` keeps admission unbounded.
    pub max_connections: Option<usize>,
}

impl ProxyConfig {
    pub fn new(
        listen_host: impl Into<String>,
        listen_port: u16,
        server_host: impl Into<String>,
        server_port: u16,
    ) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            server_host: server_host.into(),
            server_port,
            shaper: ShaperConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: None,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(ProxyError::config("listen host cannot be empty"));
        }
        if self.server_host.is_empty() {
            return Err(ProxyError::config("server host cannot be empty"));
        }
        if self.server_port == 0 {
            return Err(ProxyError::config("server port cannot be 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ProxyError::config("connect timeout must be positive"));
        }
        if self.max_connections == Some(0) {
            return Err(ProxyError::config("max_connections must be at least 1"));
        }
        self.shaper.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("transparent".parse::<AttackMode>().unwrap(), AttackMode::Transparent);
        assert_eq!("RANDOM_DELAY".parse::<AttackMode>().unwrap(), AttackMode::RandomDelay);
        assert_eq!(" drop ".parse::<AttackMode>().unwrap(), AttackMode::Drop);
        assert_eq!("Reorder".parse::<AttackMode>().unwrap(), AttackMode::Reorder);
        assert!("jitter".parse::<AttackMode>().is_err());
    }

    #[test]
    fn test_mode_fallback() {
        assert_eq!(AttackMode::from_name_or_default("jitter"), AttackMode::Transparent);
        assert_eq!(AttackMode::from_name_or_default(""), AttackMode::Transparent);
        assert_eq!(AttackMode::from_name_or_default("reorder"), AttackMode::Reorder);
    }

    #[test]
    fn test_mode_display_round_trip() {
        for mode in [
            AttackMode::Transparent,
            AttackMode::RandomDelay,
            AttackMode::Drop,
            AttackMode::Reorder,
        ] {
            assert_eq!(mode.to_string().parse::<AttackMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_shaper_defaults() {
        let config = ShaperConfig::default();
        assert_eq!(config.mode, AttackMode::Transparent);
        assert_eq!(config.reorder_window, 5);
        assert_eq!(config.chunk_size, 4096);
        assert!((config.drop_rate - 0.3).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shaper_validation() {
        let mut config = ShaperConfig::default();
        config.delay_min = 3.0;
        config.delay_max = 1.0;
        assert!(config.validate().is_err());

        let mut config = ShaperConfig::default();
        config.delay_min = -1.0;
        assert!(config.validate().is_err());

        let mut config = ShaperConfig::default();
        config.delay_max = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = ShaperConfig::default();
        config.drop_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = ShaperConfig::default();
        config.drop_rate = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = ShaperConfig::default();
        config.reorder_window = 0;
        assert!(config.validate().is_err());

        let mut config = ShaperConfig::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = ShaperConfig::default();
        config.delay_min = 1.0;
        config.delay_max = 1.0;
        config.drop_rate = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_delay_rejected() {
        let mut config = ShaperConfig::with_mode(AttackMode::RandomDelay);
        config.delay_min = 1e20;
        config.delay_max = 1e20;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("delay_max"));

        config.delay_min = 0.0;
        config.delay_max = MAX_DELAY_SECS + 1.0;
        assert!(config.validate().is_err());

        config.delay_max = MAX_DELAY_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_config_validation() {
        let config = ProxyConfig::new("0.0.0.0", 9000, "server", 9001);
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.upstream_addr(), "server:9001");

        let config = ProxyConfig::new("0.0.0.0", 9000, "", 9001);
        assert!(config.validate().is_err());

        let config = ProxyConfig::new("0.0.0.0", 9000, "server", 0);
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::new("0.0.0.0", 9000, "server", 9001);
        config.max_connections = Some(0);
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::new("0.0.0.0", 9000, "server", 9001);
        config.connect_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
