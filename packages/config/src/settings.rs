// ABOUTME: Process configuration loaded once at startup from environment variables
// ABOUTME: Invalid or out-of-range tuning values fall back to defaults, bad ports are fatal

use std::collections::HashMap;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::constants::*;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_DATABASE_URL: &str = "sqlite://kernel.db";
pub const DEFAULT_ARTIFACTS_DIR: &str = "./kernel_data";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_SANDBOX_IMAGE: &str = "python:3.11-slim";
pub const DEFAULT_SANDBOX_OUTPUT_DIR: &str = "/data";
pub const DEFAULT_FLUSH_MAX_LINES: usize = 20;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_SSE_MAX_CONNECTIONS_PER_IP: usize = 16;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub secret_key: Option<String>,
    pub sandbox_image: String,
    pub sandbox_output_dir: String,
    /// Host variables injected into every sandbox, resolved at load time
    pub platform_env: HashMap<String, String>,
    pub flush_max_lines: usize,
    pub flush_interval: Duration,
    pub subscriber_queue_capacity: usize,
    pub reconcile_on_startup: bool,
    pub sse_max_connections_per_ip: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
            secret_key: None,
            sandbox_image: DEFAULT_SANDBOX_IMAGE.to_string(),
            sandbox_output_dir: DEFAULT_SANDBOX_OUTPUT_DIR.to_string(),
            platform_env: HashMap::new(),
            flush_max_lines: DEFAULT_FLUSH_MAX_LINES,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            reconcile_on_startup: true,
            sse_max_connections_per_ip: DEFAULT_SSE_MAX_CONNECTIONS_PER_IP,
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| -> Option<String> {
            names
                .iter()
                .find_map(|name| lookup(name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = match first(&[KERNEL_API_PORT, PORT]) {
            Some(raw) => raw.parse::<u16>()?,
            None => DEFAULT_PORT,
        };
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let platform_env = first(&[KERNEL_PLATFORM_ENV])
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .filter_map(|name| match lookup(name) {
                        Some(value) => Some((name.to_string(), value)),
                        None => {
                            warn!("Platform variable {} is not set, skipping", name);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let flush_max_lines = first(&[KERNEL_FLUSH_MAX_LINES])
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| (1..=10_000).contains(&v))
            .unwrap_or(DEFAULT_FLUSH_MAX_LINES);

        let flush_interval_ms = first(&[KERNEL_FLUSH_INTERVAL_MS])
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| (50..=600_000).contains(&v))
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);

        let subscriber_queue_capacity = first(&[KERNEL_SUBSCRIBER_QUEUE_CAPACITY])
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| (16..=1_000_000).contains(&v))
            .unwrap_or(DEFAULT_SUBSCRIBER_QUEUE_CAPACITY);

        let sse_max_connections_per_ip = first(&[KERNEL_SSE_MAX_CONNECTIONS_PER_IP])
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0 && v <= 1000)
            .unwrap_or(DEFAULT_SSE_MAX_CONNECTIONS_PER_IP);

        let reconcile_on_startup = first(&[KERNEL_RECONCILE_ON_STARTUP])
            .map(|v| parse_flag(&v).unwrap_or(true))
            .unwrap_or(true);

        Ok(Self {
            host: first(&[KERNEL_API_HOST]).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            cors_origin: first(&[KERNEL_CORS_ORIGIN])
                .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string()),
            database_url: first(&[KERNEL_DATABASE_URL, DATABASE_URL])
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            artifacts_dir: first(&[KERNEL_ARTIFACTS_DIR, ARTIFACTS_DIR])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
            secret_key: first(&[KERNEL_SECRET_KEY, SECRET_KEY]),
            sandbox_image: first(&[KERNEL_SANDBOX_IMAGE])
                .unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string()),
            sandbox_output_dir: first(&[KERNEL_SANDBOX_OUTPUT_DIR])
                .unwrap_or_else(|| DEFAULT_SANDBOX_OUTPUT_DIR.to_string()),
            platform_env,
            flush_max_lines,
            flush_interval: Duration::from_millis(flush_interval_ms),
            subscriber_queue_capacity,
            reconcile_on_startup,
            sse_max_connections_per_ip,
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = KernelConfig::from_source(|_| None).unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.flush_max_lines, 20);
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert!(config.secret_key.is_none());
        assert!(config.reconcile_on_startup);
        assert!(config.platform_env.is_empty());
    }

    #[test]
    fn test_prefixed_variables_win_over_legacy_names() {
        let config = KernelConfig::from_source(lookup_from(&[
            ("PORT", "9000"),
            ("KERNEL_API_PORT", "9100"),
            ("DATABASE_URL", "sqlite://legacy.db"),
            ("SECRET_KEY", "legacy-key"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.database_url, "sqlite://legacy.db");
        assert_eq!(config.secret_key.as_deref(), Some("legacy-key"));
    }

    #[test]
    fn test_invalid_port_is_fatal() {
        let result = KernelConfig::from_source(lookup_from(&[("PORT", "not-a-port")]));
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));

        let result = KernelConfig::from_source(lookup_from(&[("PORT", "0")]));
        assert!(matches!(result, Err(ConfigError::PortOutOfRange(0))));
    }

    #[test]
    fn test_out_of_range_tuning_falls_back_to_defaults() {
        let config = KernelConfig::from_source(lookup_from(&[
            ("KERNEL_FLUSH_MAX_LINES", "0"),
            ("KERNEL_FLUSH_INTERVAL_MS", "5"),
            ("KERNEL_SUBSCRIBER_QUEUE_CAPACITY", "abc"),
            ("KERNEL_RECONCILE_ON_STARTUP", "maybe"),
        ]))
        .unwrap();

        assert_eq!(config.flush_max_lines, DEFAULT_FLUSH_MAX_LINES);
        assert_eq!(
            config.flush_interval,
            Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)
        );
        assert_eq!(
            config.subscriber_queue_capacity,
            DEFAULT_SUBSCRIBER_QUEUE_CAPACITY
        );
        assert!(config.reconcile_on_startup);
    }

    #[test]
    fn test_platform_env_resolves_named_variables() {
        let config = KernelConfig::from_source(lookup_from(&[
            ("KERNEL_PLATFORM_ENV", "SANDBOX_TOKEN, MISSING_ONE,"),
            ("SANDBOX_TOKEN", "tok-123"),
            ("KERNEL_RECONCILE_ON_STARTUP", "off"),
        ]))
        .unwrap();

        assert_eq!(config.platform_env.len(), 1);
        assert_eq!(
            config.platform_env.get("SANDBOX_TOKEN").map(String::as_str),
            Some("tok-123")
        );
        assert!(!config.reconcile_on_startup);
    }
}
