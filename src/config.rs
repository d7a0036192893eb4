/*!
 * Configuration types for Stratus
 */

use crate::error::{Result, StratusError};
use crate::signer::SignerKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stratus_core_resilience::{BackoffPolicy, BackoffStrategy};
use url::Url;

/// Smallest part a provider accepts, except for the final part (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of parts in one multipart transfer
pub const MAX_PARTS: u32 = 10_000;

/// Default reset limit for buffered bodies (128 KiB + 1)
pub const DEFAULT_RESET_LIMIT: usize = 128 * 1024 + 1;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Pinned region. When set the region cache is bypassed entirely.
    #[serde(default)]
    pub region: Option<String>,

    /// Region used to sign requests whose bucket region is unknown
    #[serde(default = "default_region")]
    pub default_region: String,

    /// Custom endpoint (e.g. a MinIO or LocalStack URL)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Use path-style addressing (`endpoint/bucket/key`)
    #[serde(default)]
    pub force_path_style: bool,

    /// Service name used in the signing scope
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Force a signing scheme instead of negotiating
    #[serde(default)]
    pub signer_override: Option<SignerKind>,

    /// Maximum bytes a buffered body keeps for replay after a checkpoint
    #[serde(default = "default_reset_limit")]
    pub reset_limit: usize,

    /// Extra attempts allowed for region and signer correction combined
    #[serde(default = "default_max_corrective_retries")]
    pub max_corrective_retries: u32,

    /// Deadline for a single attempt in seconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Transport-level retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Multipart transfer tuning
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Logging setup
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backoff retry configuration for transport failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Jitter factor (0.0-1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

/// Delay growth between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
    #[default]
    ExponentialWithJitter,
}

/// Multipart transfer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,

    #[serde(default = "default_part_size")]
    pub default_part_size: u64,

    #[serde(default = "default_max_parts")]
    pub max_parts: u32,

    /// Objects at or above this size should use a multipart transfer
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Concurrent part workers (0 = auto)
    #[serde(default)]
    pub concurrency: usize,

    /// Attempts per part before the part is reported as failed
    #[serde(default = "default_part_retry_attempts")]
    pub part_retry_attempts: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            region: None,
            default_region: default_region(),
            endpoint: None,
            force_path_style: false,
            service_name: default_service_name(),
            signer_override: None,
            reset_limit: default_reset_limit(),
            max_corrective_retries: default_max_corrective_retries(),
            attempt_timeout_secs: default_attempt_timeout(),
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: RetryStrategy::default(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_part_size: default_min_part_size(),
            default_part_size: default_part_size(),
            max_parts: default_max_parts(),
            multipart_threshold: default_multipart_threshold(),
            concurrency: 0,
            part_retry_attempts: default_part_retry_attempts(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_service_name() -> String {
    "s3".to_string()
}

fn default_reset_limit() -> usize {
    DEFAULT_RESET_LIMIT
}

fn default_max_corrective_retries() -> u32 {
    2
}

fn default_attempt_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    20_000
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_min_part_size() -> u64 {
    MIN_PART_SIZE
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_parts() -> u32 {
    MAX_PARTS
}

fn default_multipart_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_part_retry_attempts() -> u32 {
    3
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(contents)
            .map_err(|e| StratusError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| StratusError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Client pinned to `region`
    pub fn pinned(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..Default::default()
        }
    }

    /// Overlay `STRATUS_REGION`, `STRATUS_ENDPOINT` and `STRATUS_SIGNER`
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(region) = std::env::var("STRATUS_REGION") {
            if !region.is_empty() {
                self.region = Some(region);
            }
        }
        if let Ok(endpoint) = std::env::var("STRATUS_ENDPOINT") {
            if !endpoint.is_empty() {
                self.endpoint = Some(endpoint);
            }
        }
        if let Ok(signer) = std::env::var("STRATUS_SIGNER") {
            self.signer_override = Some(signer.parse()?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(region) = &self.region {
            if region.trim().is_empty() {
                return Err(StratusError::Config(
                    "Pinned region cannot be empty".to_string(),
                ));
            }
        }

        if self.default_region.trim().is_empty() {
            return Err(StratusError::Config(
                "Default region cannot be empty".to_string(),
            ));
        }

        if let Some(endpoint) = &self.endpoint {
            self.parse_endpoint(endpoint)?;
        }

        if self.transfer.min_part_size == 0 {
            return Err(StratusError::Config(
                "Minimum part size must be positive".to_string(),
            ));
        }

        if self.transfer.max_parts == 0 {
            return Err(StratusError::Config(
                "Maximum part count must be at least 1".to_string(),
            ));
        }

        if self.attempt_timeout_secs == 0 {
            return Err(StratusError::Config(
                "Attempt timeout must be at least 1 second".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(StratusError::Config(format!(
                "Jitter factor {} must be between 0.0 and 1.0",
                self.retry.jitter_factor
            )));
        }

        Ok(())
    }

    fn parse_endpoint(&self, endpoint: &str) -> Result<Url> {
        let url = Url::parse(endpoint)
            .map_err(|e| StratusError::Config(format!("Invalid endpoint {}: {}", endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StratusError::Config(format!(
                "Endpoint {} must use http or https",
                endpoint
            )));
        }
        Ok(url)
    }

    /// Parsed custom endpoint, if any
    pub fn endpoint_url(&self) -> Result<Option<Url>> {
        self.endpoint
            .as_deref()
            .map(|endpoint| self.parse_endpoint(endpoint))
            .transpose()
    }

    /// Deadline for one attempt
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Backoff policy derived from the retry section
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            strategy: match self.retry.strategy {
                RetryStrategy::Fixed => BackoffStrategy::Fixed,
                RetryStrategy::Linear => BackoffStrategy::Linear,
                RetryStrategy::Exponential => BackoffStrategy::Exponential,
                RetryStrategy::ExponentialWithJitter => BackoffStrategy::ExponentialWithJitter,
            },
            jitter_factor: self.retry.jitter_factor,
        }
    }
}

impl TransferConfig {
    /// Effective worker count; 0 means auto-detect
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            detect_optimal_concurrency()
        }
    }
}

/// 2x available parallelism, capped at 16
pub fn detect_optimal_concurrency() -> usize {
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpu_count * 2).min(16)
}
