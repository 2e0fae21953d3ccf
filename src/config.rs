// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Configuration for the counter ledger service.
//!
//! Loaded from an optional file named by `COUNTER_LEDGER_CONFIG`, then
//! overridden by `COUNTER_LEDGER__*` environment variables with `__` as the
//! nesting separator (e.g. `COUNTER_LEDGER__CREATION_LIMIT__MAX_ACTIONS=10`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable naming an optional config file.
pub const CONFIG_FILE_ENV: &str = "COUNTER_LEDGER_CONFIG";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "COUNTER_LEDGER";

/// Configuration for the counter ledger service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite database path, or "memory" (default: counters.db)
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Take the client IP from the first X-Forwarded-For entry (default: false)
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Interval between limiter sweeps and hit retention purges (default: 60)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Counting behaviour
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Counter creation throttling per client IP
    #[serde(default)]
    pub creation_limit: WindowConfig,

    /// Admin login lockout per client IP
    #[serde(default)]
    pub login_limit: LockoutConfig,

    /// Admin authentication
    #[serde(default)]
    pub admin: AdminConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Counting behaviour shared by all counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Throttle applied to unlimited counters without their own (default: 0, every hit counts)
    #[serde(default)]
    pub unlimited_throttle_secs: u64,

    /// Days without hits before a counter is reported inactive (default: 30)
    #[serde(default = "default_inactive_threshold_days")]
    pub inactive_threshold_days: u32,

    /// Days to keep per-visitor hit records; 0 keeps them forever (default: 0)
    #[serde(default)]
    pub hit_retention_days: u32,

    /// Length of generated counter ids (default: 8)
    #[serde(default = "default_id_length")]
    pub id_length: usize,
}

/// Sliding window: at most `max_actions` per identity per `window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Maximum actions per window (default: 5)
    #[serde(default = "default_max_actions")]
    pub max_actions: u32,

    /// Window length in seconds (default: 3600)
    #[serde(default = "default_creation_window_secs")]
    pub window_secs: u64,
}

/// Failure-count lockout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Failures within the window that trigger a lockout (default: 5)
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Window in which failures accumulate, in seconds (default: 900)
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// Lockout length in seconds (default: 900)
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

/// Admin authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Argon2 PHC hash of the admin password; admin login is disabled when unset
    #[serde(default)]
    pub password_hash: Option<String>,

    /// Session lifetime in seconds (default: 86400)
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

// Default value functions
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> String {
    "counters.db".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_inactive_threshold_days() -> u32 {
    30
}

fn default_id_length() -> usize {
    8
}

fn default_max_actions() -> u32 {
    5
}

fn default_creation_window_secs() -> u64 {
    3600
}

fn default_max_failures() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    900
}

fn default_lockout_secs() -> u64 {
    900
}

fn default_session_ttl_secs() -> u64 {
    86_400
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            trust_forwarded_for: false,
            sweep_interval_secs: default_sweep_interval_secs(),
            ledger: LedgerConfig::default(),
            creation_limit: WindowConfig::default(),
            login_limit: LockoutConfig::default(),
            admin: AdminConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            unlimited_throttle_secs: 0,
            inactive_threshold_days: default_inactive_threshold_days(),
            hit_retention_days: 0,
            id_length: default_id_length(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_actions: default_max_actions(),
            window_secs: default_creation_window_secs(),
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            failure_window_secs: default_failure_window_secs(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            password_hash: None,
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the environment.
    pub fn load() -> Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(::config::File::with_name(&path));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Get the sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl LedgerConfig {
    /// Default throttle for unlimited counters in milliseconds
    pub fn unlimited_throttle_ms(&self) -> i64 {
        i64::try_from(self.unlimited_throttle_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

impl WindowConfig {
    /// Get the window duration
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl LockoutConfig {
    /// Get the failure window duration
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// Get the lockout duration
    pub fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }
}
