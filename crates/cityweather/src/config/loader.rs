use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::retry::MAX_JITTER;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.worker_count == 0 {
        return Err(invalid("worker_count must be greater than 0"));
    }
    if config.queue_capacity == Some(0) {
        return Err(invalid("queue_capacity must be greater than 0"));
    }
    if config.ingest.batch_size == 0 {
        return Err(invalid("ingest.batch_size must be greater than 0"));
    }
    if config.ingest.max_name_length == 0 {
        return Err(invalid("ingest.max_name_length must be greater than 0"));
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(invalid(format!(
            "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
            retry.base_delay_ms, retry.max_delay_ms
        )));
    }
    if !(0.0..=MAX_JITTER).contains(&retry.jitter) {
        return Err(invalid(format!(
            "retry.jitter must be between 0 and {:.3}",
            MAX_JITTER
        )));
    }

    let provider = &config.provider;
    if !(provider.requests_per_second.is_finite() && provider.requests_per_second > 0.0) {
        return Err(invalid("provider.requests_per_second must be positive"));
    }
    if provider.burst == 0 {
        return Err(invalid("provider.burst must be greater than 0"));
    }
    if provider.timeout_ms == 0 {
        return Err(invalid("provider.timeout_ms must be greater than 0"));
    }

    Ok(())
}
