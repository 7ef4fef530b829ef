//! Upstream weather providers.
//!
//! The pipeline only ever sees the [`WeatherProvider`] trait. Failures are
//! classified by [`ErrorKind`] so the retry policy can tell a hiccup from
//! a request that will never succeed.

pub mod openweather;
pub mod rate_limit;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Weather;

pub use openweather::OpenWeatherProvider;
pub use rate_limit::RateLimitedProvider;

/// Classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    NotFound,
    UpstreamFailure,
    BadRequest,
}

impl ErrorKind {
    /// Transient failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::UpstreamFailure
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::RateLimited => write!(f, "rate limited"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::UpstreamFailure => write!(f, "upstream failure"),
            ErrorKind::BadRequest => write!(f, "bad request"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// A source of current weather for a city.
pub trait WeatherProvider: Send + Sync {
    /// Fetches current conditions. Must give up after `timeout` with
    /// [`ErrorKind::Timeout`].
    fn fetch(&self, city: &str, timeout: Duration) -> Result<Weather, ProviderError>;
}
