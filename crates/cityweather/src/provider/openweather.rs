//! OpenWeatherMap current-weather provider.

use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{ErrorKind, ProviderError, WeatherProvider};
use crate::models::Weather;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    main: MainReadings,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct MainReadings {
    temp: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct Condition {
    main: String,
}

pub struct OpenWeatherProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenWeatherProvider {
    pub fn new(base_url: &str, api_key: SecretString) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("cityweather/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ProviderError::new(
                    ErrorKind::UpstreamFailure,
                    format!("failed to build HTTP client: {}", e),
                )
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/data/2.5/weather", self.base_url)
    }
}

impl WeatherProvider for OpenWeatherProvider {
    fn fetch(&self, city: &str, timeout: Duration) -> Result<Weather, ProviderError> {
        let response = self
            .client
            .get(self.endpoint())
            .query(&[
                ("q", city),
                ("appid", self.api_key.expose_secret()),
                ("units", "metric"),
            ])
            .timeout(timeout)
            .send()
            .map_err(|e| classify_transport_error(city, &e))?;

        let status = response.status();
        if let Some(kind) = classify_status(status) {
            log::debug!("OpenWeatherMap returned {} for '{}'", status, city);
            return Err(ProviderError::new(
                kind,
                format!("upstream returned {} for '{}'", status, city),
            ));
        }

        let body = response
            .text()
            .map_err(|e| classify_transport_error(city, &e))?;
        parse_body(&body)
    }
}

/// Maps a non-success HTTP status onto an error class. `None` for 2xx.
pub fn classify_status(status: StatusCode) -> Option<ErrorKind> {
    if status.is_success() {
        return None;
    }
    let kind = match status.as_u16() {
        404 => ErrorKind::NotFound,
        429 => ErrorKind::RateLimited,
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::UpstreamFailure,
        400..=499 => ErrorKind::BadRequest,
        _ => ErrorKind::UpstreamFailure,
    };
    Some(kind)
}

fn classify_transport_error(city: &str, error: &reqwest::Error) -> ProviderError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::UpstreamFailure
    };
    ProviderError::new(kind, format!("request for '{}' failed: {}", city, error))
}

fn parse_body(body: &str) -> Result<Weather, ProviderError> {
    let current: CurrentWeather = serde_json::from_str(body).map_err(|e| {
        ProviderError::new(
            ErrorKind::UpstreamFailure,
            format!("malformed weather response: {}", e),
        )
    })?;
    let condition = current
        .weather
        .first()
        .map(|c| c.main.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    Ok(Weather {
        temperature: current.main.temp,
        condition,
        humidity: current.main.humidity.round().clamp(0.0, 100.0) as u8,
    })
}
