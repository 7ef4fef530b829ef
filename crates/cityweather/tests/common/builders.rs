//! Builders for test configuration and provider responses.

#![allow(dead_code)]

use cityweather::config::{Config, IngestConfig, ProviderConfig, RetryConfig};
use cityweather::{ErrorKind, ProviderError, Weather};

/// Builder for `Config` instances tuned for tests: few workers, millisecond
/// backoff, no jitter.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config {
                version: "1.0".to_string(),
                database_path: None,
                cache_ttl_secs: 600,
                worker_count: 2,
                queue_capacity: Some(64),
                retry: RetryConfig {
                    max_attempts: 3,
                    base_delay_ms: 1,
                    max_delay_ms: 10,
                    jitter: 0.0,
                },
                ingest: IngestConfig::default(),
                provider: ProviderConfig::default(),
            },
        }
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.ingest.batch_size = size;
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache_ttl_secs = secs;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn weather(temperature: f64, condition: &str) -> Weather {
    Weather {
        temperature,
        condition: condition.to_string(),
        humidity: 50,
    }
}

pub fn timeout() -> ProviderError {
    ProviderError::new(ErrorKind::Timeout, "request timed out")
}

pub fn upstream_failure() -> ProviderError {
    ProviderError::new(ErrorKind::UpstreamFailure, "HTTP 503")
}

pub fn not_found() -> ProviderError {
    ProviderError::new(ErrorKind::NotFound, "city not found")
}

/// Joins city names into CSV content, one per line.
pub fn csv(lines: &[&str]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
