//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::constants::{
    DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_START_MS, DEFAULT_DEGRADED_REQUEUE_SECS,
    DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_INSTANCE_RETRY_ATTEMPTS,
    DEFAULT_INSTANCE_RETRY_DELAY_MS, DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
    DEFAULT_METRICS_PORT, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_SERVER_POLL_INTERVAL_MS,
    DEFAULT_SERVER_STARTUP_TIMEOUT_SECS, DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
    DEFAULT_WATCH_RESTART_DELAY_SECS,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "plain" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// HTTP port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// How long to wait for the HTTP server to bind before giving up (seconds)
    pub server_startup_timeout_secs: u64,
    /// Poll interval while waiting for the HTTP server (milliseconds)
    pub server_poll_interval_ms: u64,
    /// Fibonacci backoff starting value for failed BindingConfig reconciliations (milliseconds)
    pub backoff_start_ms: u64,
    /// Fibonacci backoff cap (milliseconds)
    pub backoff_max_ms: u64,
    /// Delay before re-opening an instance watch stream (seconds)
    pub watch_restart_delay_secs: u64,
    /// Delay before restarting the BindingConfig controller stream after it ends (seconds)
    pub watch_restart_delay_after_end_secs: u64,
    /// Periodic resync interval for healthy BindingConfigs (seconds)
    pub resync_interval_secs: u64,
    /// Requeue delay when some instances of a BindingConfig failed (seconds)
    pub degraded_requeue_secs: u64,
    /// Namespace instance watches are scoped to; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Maximum concurrent (config, instance) reconciliations
    pub max_concurrent_reconciliations: usize,
    /// Attempts per instance event unit before it is dropped
    pub instance_retry_attempts: u32,
    /// Delay between instance event unit attempts (milliseconds)
    pub instance_retry_delay_ms: u64,
    /// Capacity of the instance event channel
    pub event_channel_capacity: usize,
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            watch_restart_delay_after_end_secs: DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            degraded_requeue_secs: DEFAULT_DEGRADED_REQUEUE_SECS,
            watch_namespace: None,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            instance_retry_attempts: DEFAULT_INSTANCE_RETRY_ATTEMPTS,
            instance_retry_delay_ms: DEFAULT_INSTANCE_RETRY_DELAY_MS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// `from_env` is a thin wrapper over this; tests pass a map instead of
    /// mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            metrics_port: parse_or_default(&lookup, "METRICS_PORT", defaults.metrics_port),
            server_startup_timeout_secs: parse_or_default(
                &lookup,
                "SERVER_STARTUP_TIMEOUT_SECS",
                defaults.server_startup_timeout_secs,
            ),
            server_poll_interval_ms: parse_or_default(
                &lookup,
                "SERVER_POLL_INTERVAL_MS",
                defaults.server_poll_interval_ms,
            ),
            backoff_start_ms: parse_or_default(&lookup, "BACKOFF_START_MS", defaults.backoff_start_ms),
            backoff_max_ms: parse_or_default(&lookup, "BACKOFF_MAX_MS", defaults.backoff_max_ms),
            watch_restart_delay_secs: parse_or_default(
                &lookup,
                "WATCH_RESTART_DELAY_SECS",
                defaults.watch_restart_delay_secs,
            ),
            watch_restart_delay_after_end_secs: parse_or_default(
                &lookup,
                "WATCH_RESTART_DELAY_AFTER_END_SECS",
                defaults.watch_restart_delay_after_end_secs,
            ),
            resync_interval_secs: parse_or_default(
                &lookup,
                "RESYNC_INTERVAL_SECS",
                defaults.resync_interval_secs,
            ),
            degraded_requeue_secs: parse_or_default(
                &lookup,
                "DEGRADED_REQUEUE_SECS",
                defaults.degraded_requeue_secs,
            ),
            watch_namespace: lookup("WATCH_NAMESPACE")
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty()),
            max_concurrent_reconciliations: parse_or_default(
                &lookup,
                "MAX_CONCURRENT_RECONCILIATIONS",
                defaults.max_concurrent_reconciliations,
            )
            .max(1),
            instance_retry_attempts: parse_or_default(
                &lookup,
                "INSTANCE_RETRY_ATTEMPTS",
                defaults.instance_retry_attempts,
            )
            .max(1),
            instance_retry_delay_ms: parse_or_default(
                &lookup,
                "INSTANCE_RETRY_DELAY_MS",
                defaults.instance_retry_delay_ms,
            ),
            event_channel_capacity: parse_or_default(
                &lookup,
                "EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            )
            .max(1),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_or_default(&lookup, "LOG_FORMAT", defaults.log_format),
        }
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Get controller stream restart delay duration
    pub fn watch_restart_delay_after_end(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_after_end_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn degraded_requeue(&self) -> Duration {
        Duration::from_secs(self.degraded_requeue_secs)
    }

    pub fn instance_retry_delay(&self) -> Duration {
        Duration::from_millis(self.instance_retry_delay_ms)
    }

    pub fn server_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.server_startup_timeout_secs)
    }

    pub fn server_poll_interval(&self) -> Duration {
        Duration::from_millis(self.server_poll_interval_ms)
    }
}

/// Parse a variable or fall back to the default, warning on malformed values
fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(key, value = raw.as_str(), error = %e, "Ignoring malformed configuration value");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ControllerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.max_concurrent_reconciliations,
            DEFAULT_MAX_CONCURRENT_RECONCILIATIONS
        );
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = config_from(&[
            ("METRICS_PORT", "9090"),
            ("WATCH_NAMESPACE", "team-a"),
            ("LOG_FORMAT", "TEXT"),
            ("INSTANCE_RETRY_DELAY_MS", "250"),
        ]);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.watch_namespace.as_deref(), Some("team-a"));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.instance_retry_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = config_from(&[("METRICS_PORT", "not-a-port"), ("LOG_FORMAT", "xml")]);
        assert_eq!(config.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_blank_watch_namespace_means_all() {
        let config = config_from(&[("WATCH_NAMESPACE", "  ")]);
        assert_eq!(config.watch_namespace, None);
    }

    #[test]
    fn test_concurrency_is_at_least_one() {
        let config = config_from(&[("MAX_CONCURRENT_RECONCILIATIONS", "0")]);
        assert_eq!(config.max_concurrent_reconciliations, 1);
    }
}
