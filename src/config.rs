//! The recognized configuration surface, resolved from environment
//! variables with typed defaults — mirrors the way the runtime driver's
//! own `docker_host` configuration is resolved: read an env var, fall
//! back to a sane default, validate at the point of use.

use std::{path::PathBuf, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid port range: lo={lo} must be < hi={hi}")]
    InvalidPortRange { lo: u16, hi: u16 },
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn new(lo: u16, hi: u16) -> Result<Self, ConfigurationError> {
        if lo >= hi {
            return Err(ConfigurationError::InvalidPortRange { lo, hi });
        }
        Ok(Self { lo, hi })
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub tcp_timeout: Duration,
    pub http_path: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            tcp_timeout: Duration::from_secs(3),
            http_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub cooldown: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_interval: Duration::from_secs(2),
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    pub interval: Duration,
    pub history_size: usize,
    pub change_epsilon_pct: f64,
    pub max_silence: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            history_size: 1000,
            change_epsilon_pct: 1.0,
            max_silence: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackupDefaults {
    pub enabled: bool,
    pub interval_hours: u32,
    pub retention_days: u32,
    pub max_backups: u32,
}

impl Default for BackupDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 24,
            retention_days: 14,
            max_backups: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub scheduler_tick: Duration,
    pub defaults: BackupDefaults,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            scheduler_tick: Duration::from_secs(60),
            defaults: BackupDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeTimeouts {
    pub call: Duration,
    pub stats: Duration,
}

impl Default for RuntimeTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(10),
            stats: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration, assembled by the embedder (from env vars,
/// a config file, CLI flags — whatever fits) and handed to the engines.
#[derive(Debug, Clone)]
pub struct Config {
    pub port_range: PortRange,
    pub templates_root: PathBuf,
    pub workspaces_root: PathBuf,
    pub backups_root: PathBuf,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub metrics: MetricsConfig,
    pub backup: BackupConfig,
    pub runtime_timeouts: RuntimeTimeouts,
}

impl Config {
    /// Loads configuration the way `DOCKER_HOST` itself gets resolved:
    /// environment variables with documented fallbacks. Unlike docker-host
    /// resolution there is no filesystem probing here — every value
    /// either comes from the environment or a fixed default.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let lo = env_u16("CLUSTERFORGE_PORT_RANGE_LO", 20000)?;
        let hi = env_u16("CLUSTERFORGE_PORT_RANGE_HI", 30000)?;
        Ok(Self {
            port_range: PortRange::new(lo, hi)?,
            templates_root: env_path("CLUSTERFORGE_TEMPLATES_ROOT", "/var/lib/clusterforge/templates"),
            workspaces_root: env_path("CLUSTERFORGE_WORKSPACES_ROOT", "/var/lib/clusterforge/workspaces"),
            backups_root: env_path("CLUSTERFORGE_BACKUPS_ROOT", "/var/lib/clusterforge/backups"),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            metrics: MetricsConfig::default(),
            backup: BackupConfig::default(),
            runtime_timeouts: RuntimeTimeouts::default(),
        })
    }
}

fn env_u16(name: &'static str, default: u16) -> Result<u16, ConfigurationError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigurationError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

fn env_path(name: &'static str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_port_range() {
        assert!(PortRange::new(100, 100).is_err());
        assert!(PortRange::new(200, 100).is_err());
        assert!(PortRange::new(100, 200).is_ok());
    }
}
