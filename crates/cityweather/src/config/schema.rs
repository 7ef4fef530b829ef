use serde::{Deserialize, Serialize};

use crate::ingest::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_NAME_LENGTH};
use crate::provider::openweather::DEFAULT_BASE_URL;

/// Queue slots per worker when `queue_capacity` is not set.
pub const QUEUE_SLOTS_PER_WORKER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            worker_count: default_worker_count(),
            queue_capacity: None,
            retry: RetryConfig::default(),
            ingest: IngestConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl Config {
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(self.worker_count.saturating_mul(QUEUE_SLOTS_PER_WORKER))
            .max(1)
    }
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_name_length() -> usize {
    DEFAULT_MAX_NAME_LENGTH
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_name_length: DEFAULT_MAX_NAME_LENGTH,
        }
    }
}

/// Upstream weather API settings. At most one key source is used; see
/// [`crate::secrets::resolve_secret`] for precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_api_key_env() -> Option<String> {
    Some("OPENWEATHER_API_KEY".to_string())
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_file: None,
            api_key_env: default_api_key_env(),
            timeout_ms: default_timeout_ms(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}
