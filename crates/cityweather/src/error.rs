use std::path::PathBuf;
use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum CityWeatherError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Failures while reading the uploaded city list.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read import stream at line {line}: {source}")]
    Unreadable {
        line: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Import contained no valid city rows ({invalid} invalid)")]
    NoValidRows { invalid: u64 },
}

/// Failures handing a task to the worker queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Task queue is full, try again later")]
    Full,

    #[error("Task queue is closed")]
    Closed,
}

/// Errors surfaced synchronously when an import is started.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Coordinator unavailable: {0}")]
    CoordinatorUnavailable(DispatchError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("Failed to spawn ingestion thread: {0}")]
    SpawnFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Invalid city name: '{0}'")]
    InvalidCity(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid pagination cursor")]
    InvalidCursor,

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, CityWeatherError>;
