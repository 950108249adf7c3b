//! Configuration structures and loading logic

use crate::health::{MonitorConfig, TransportKind};
use crate::storage::CacheLimits;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "MODEL_DELIVERY_";

/// Delivery engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Root of the on-disk cache (models/, backups/, tmp/)
    pub cache_dir: PathBuf,
    /// Capacity in stored (on-disk) bytes
    pub max_cache_bytes: u64,
    pub max_models: usize,
    pub backup_retention_days: u32,

    pub probe_interval_secs: u64,
    /// Reachability probe target. Probing is disabled without one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_url: Option<String>,
    pub probe_timeout_secs: u64,
    pub fetch_timeout_secs: u64,

    /// Size of the latency and outcome windows
    pub sample_window: usize,
    pub download_latency_threshold_ms: u64,
    pub download_error_rate_threshold: f64,
    /// Treat the link as Wi-Fi rather than cellular
    pub high_bandwidth: bool,

    /// JSON file of published updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_file: Option<PathBuf>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_cache_bytes: 256 * 1024 * 1024,
            max_models: 16,
            backup_retention_days: 7,
            probe_interval_secs: 30,
            probe_url: None,
            probe_timeout_secs: 5,
            fetch_timeout_secs: 120,
            sample_window: 100,
            download_latency_threshold_ms: 1000,
            download_error_rate_threshold: 0.1,
            high_bandwidth: true,
            catalog_file: None,
        }
    }
}

impl DeliveryConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = env_var("CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_var("PROBE_URL") {
            self.probe_url = Some(url);
        }
        if let Some(file) = env_var("CATALOG_FILE") {
            self.catalog_file = Some(PathBuf::from(file));
        }

        parse_env("MAX_CACHE_BYTES", &mut self.max_cache_bytes)?;
        parse_env("MAX_MODELS", &mut self.max_models)?;
        parse_env("BACKUP_RETENTION_DAYS", &mut self.backup_retention_days)?;
        parse_env("PROBE_INTERVAL_SECS", &mut self.probe_interval_secs)?;
        parse_env("PROBE_TIMEOUT_SECS", &mut self.probe_timeout_secs)?;
        parse_env("FETCH_TIMEOUT_SECS", &mut self.fetch_timeout_secs)?;
        parse_env("SAMPLE_WINDOW", &mut self.sample_window)?;
        parse_env(
            "DOWNLOAD_LATENCY_THRESHOLD_MS",
            &mut self.download_latency_threshold_ms,
        )?;
        parse_env(
            "DOWNLOAD_ERROR_RATE_THRESHOLD",
            &mut self.download_error_rate_threshold,
        )?;
        parse_env("HIGH_BANDWIDTH", &mut self.high_bandwidth)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_bytes == 0 {
            anyhow::bail!("max_cache_bytes must be greater than zero");
        }
        if self.max_models == 0 {
            anyhow::bail!("max_models must be greater than zero");
        }
        if self.sample_window == 0 {
            anyhow::bail!("sample_window must be greater than zero");
        }
        if self.probe_interval_secs == 0 {
            anyhow::bail!("probe_interval_secs must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.download_error_rate_threshold) {
            anyhow::bail!(
                "download_error_rate_threshold must be within [0, 1] (got {})",
                self.download_error_rate_threshold
            );
        }
        if self.cache_dir.as_os_str().is_empty() {
            anyhow::bail!("cache_dir cannot be empty");
        }

        Ok(())
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_size: self.max_cache_bytes,
            max_models: self.max_models,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            window_capacity: self.sample_window,
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            probe_url: self.probe_url.clone(),
            download_latency_threshold: Duration::from_millis(self.download_latency_threshold_ms),
            download_error_rate_threshold: self.download_error_rate_threshold,
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        if self.high_bandwidth {
            TransportKind::Wifi
        } else {
            TransportKind::Cellular
        }
    }

    pub fn backup_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.backup_retention_days))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key)).ok()
}

fn parse_env<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = env_var(key) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}{} value: {:?}", ENV_PREFIX, key, raw))?;
    }
    Ok(())
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("model-delivery")
}
