//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional; an empty file runs the daemon with library
//! defaults and no auth directory.

use kiro_pool::{PhraseClassifier, QuotaMonitorConfig, RateLimiterConfig, RefresherConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest duration any `*_secs` setting may hold (one year).
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

/// HTTP listener and credential location
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Directory holding `kiro-*.json` credential files. Overridden by
    /// AUTH_DIR; unset disables refresh.
    #[serde(default)]
    pub auth_dir: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_dir: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Background refresher settings
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_refresh_timeout")]
    pub timeout_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            timeout_secs: default_refresh_timeout(),
        }
    }
}

/// Rate limiter overrides. Anything left out keeps the library default.
#[derive(Debug, Default, Deserialize)]
pub struct RateLimitConfig {
    pub min_token_interval_secs: Option<u64>,
    pub max_token_interval_secs: Option<u64>,
    pub daily_max_requests: Option<u32>,
    pub jitter_percent: Option<f64>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub suspend_cooldown_secs: Option<u64>,
    /// Added to the built-in suspension phrases
    #[serde(default)]
    pub extra_suspension_phrases: Vec<String>,
}

/// Cooldown tracker settings
#[derive(Debug, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Usage quota monitor settings
#[derive(Debug, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_quota_enabled")]
    pub enabled: bool,
    #[serde(default = "default_quota_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_quota_timeout")]
    pub timeout_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: default_quota_enabled(),
            interval_secs: default_quota_interval(),
            timeout_secs: default_quota_timeout(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    256
}

fn default_refresh_interval() -> u64 {
    kiro_pool::refresh::DEFAULT_REFRESH_INTERVAL.as_secs()
}

fn default_batch_size() -> usize {
    kiro_pool::refresh::DEFAULT_BATCH_SIZE
}

fn default_concurrency() -> usize {
    kiro_pool::refresh::DEFAULT_CONCURRENCY
}

fn default_refresh_timeout() -> u64 {
    kiro_pool::refresh::DEFAULT_REFRESH_TIMEOUT.as_secs()
}

fn default_sweep_interval() -> u64 {
    kiro_pool::cooldown::DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_quota_enabled() -> bool {
    true
}

fn default_quota_interval() -> u64 {
    kiro_pool::quota::DEFAULT_QUOTA_INTERVAL.as_secs()
}

fn default_quota_timeout() -> u64 {
    kiro_pool::quota::DEFAULT_QUOTA_TIMEOUT.as_secs()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Auth directory resolution order:
    /// 1. AUTH_DIR env var (ignored when empty)
    /// 2. daemon.auth_dir from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(dir) = std::env::var("AUTH_DIR")
            && !dir.trim().is_empty()
        {
            config.daemon.auth_dir = Some(PathBuf::from(dir.trim()));
        }
        config.daemon.auth_dir = config
            .daemon
            .auth_dir
            .take()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| expand_home(&p));

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let non_zero = [
            ("daemon.max_connections", self.daemon.max_connections as u64),
            ("refresh.interval_secs", self.refresh.interval_secs),
            ("refresh.batch_size", self.refresh.batch_size as u64),
            ("refresh.concurrency", self.refresh.concurrency as u64),
            ("refresh.timeout_secs", self.refresh.timeout_secs),
            ("cooldown.sweep_interval_secs", self.cooldown.sweep_interval_secs),
            ("quota.interval_secs", self.quota.interval_secs),
            ("quota.timeout_secs", self.quota.timeout_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        let r = &self.rate_limit;
        let durations = [
            ("refresh.interval_secs", Some(self.refresh.interval_secs)),
            ("refresh.timeout_secs", Some(self.refresh.timeout_secs)),
            ("cooldown.sweep_interval_secs", Some(self.cooldown.sweep_interval_secs)),
            ("quota.interval_secs", Some(self.quota.interval_secs)),
            ("quota.timeout_secs", Some(self.quota.timeout_secs)),
            ("rate_limit.min_token_interval_secs", r.min_token_interval_secs),
            ("rate_limit.max_token_interval_secs", r.max_token_interval_secs),
            ("rate_limit.backoff_base_secs", r.backoff_base_secs),
            ("rate_limit.backoff_max_secs", r.backoff_max_secs),
            ("rate_limit.suspend_cooldown_secs", r.suspend_cooldown_secs),
        ];
        for (name, value) in durations {
            if value.is_some_and(|secs| secs > MAX_DURATION_SECS) {
                return Err(common::Error::Config(format!(
                    "{name} must not exceed {MAX_DURATION_SECS} seconds"
                )));
            }
        }

        let limits = self.rate_limiter_config();
        if limits.min_token_interval > limits.max_token_interval {
            return Err(common::Error::Config(
                "rate_limit.min_token_interval_secs must not exceed max_token_interval_secs"
                    .into(),
            ));
        }
        if limits.backoff_base > limits.backoff_max {
            return Err(common::Error::Config(
                "rate_limit.backoff_base_secs must not exceed backoff_max_secs".into(),
            ));
        }
        if !(limits.backoff_multiplier.is_finite() && limits.backoff_multiplier >= 1.0) {
            return Err(common::Error::Config(
                "rate_limit.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if !limits.jitter_percent.is_finite() {
            return Err(common::Error::Config(
                "rate_limit.jitter_percent must be a finite number".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("kiro-pool.toml")
    }

    pub fn refresher_config(&self) -> RefresherConfig {
        RefresherConfig {
            interval: Duration::from_secs(self.refresh.interval_secs),
            batch_size: self.refresh.batch_size,
            concurrency: self.refresh.concurrency,
            timeout: Duration::from_secs(self.refresh.timeout_secs),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        let r = &self.rate_limit;
        let defaults = RateLimiterConfig::default();
        RateLimiterConfig {
            min_token_interval: r
                .min_token_interval_secs
                .map_or(defaults.min_token_interval, Duration::from_secs),
            max_token_interval: r
                .max_token_interval_secs
                .map_or(defaults.max_token_interval, Duration::from_secs),
            daily_max_requests: r.daily_max_requests.unwrap_or(defaults.daily_max_requests),
            jitter_percent: r.jitter_percent.unwrap_or(defaults.jitter_percent),
            backoff_base: r
                .backoff_base_secs
                .map_or(defaults.backoff_base, Duration::from_secs),
            backoff_max: r
                .backoff_max_secs
                .map_or(defaults.backoff_max, Duration::from_secs),
            backoff_multiplier: r.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            suspend_cooldown: r
                .suspend_cooldown_secs
                .map_or(defaults.suspend_cooldown, Duration::from_secs),
        }
    }

    pub fn suspension_classifier(&self) -> PhraseClassifier {
        self.rate_limit
            .extra_suspension_phrases
            .iter()
            .fold(PhraseClassifier::default(), |c, phrase| c.with_phrase(phrase))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cooldown.sweep_interval_secs)
    }

    pub fn quota_monitor_config(&self) -> QuotaMonitorConfig {
        QuotaMonitorConfig {
            interval: Duration::from_secs(self.quota.interval_secs),
            timeout: Duration::from_secs(self.quota.timeout_secs),
            ..Default::default()
        }
    }
}

/// Expand a leading `~` against HOME. Paths without one, or with HOME
/// unset, come back unchanged.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
