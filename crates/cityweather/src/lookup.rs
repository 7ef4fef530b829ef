//! Single-city weather lookup over the shared cache.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::WeatherCache;
use crate::clock::Clock;
use crate::error::LookupError;
use crate::ingest::normalize_city_name;
use crate::models::RefreshStatus;
use crate::provider::WeatherProvider;
use crate::store::{CityStore, SearchHistoryStore, SearchRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub city: String,
    pub temperature: f64,
    pub condition: String,
    pub humidity: u8,
    pub cache_hit: bool,
}

#[derive(Clone)]
pub struct WeatherLookup {
    cities: Arc<dyn CityStore>,
    history: Arc<dyn SearchHistoryStore>,
    provider: Arc<dyn WeatherProvider>,
    cache: Arc<WeatherCache>,
    clock: Arc<dyn Clock>,
    max_name_length: usize,
    timeout: Duration,
}

impl WeatherLookup {
    pub fn new(
        cities: Arc<dyn CityStore>,
        history: Arc<dyn SearchHistoryStore>,
        provider: Arc<dyn WeatherProvider>,
        cache: Arc<WeatherCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cities,
            history,
            provider,
            cache,
            clock,
            max_name_length: crate::ingest::DEFAULT_MAX_NAME_LENGTH,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_max_name_length(mut self, max_name_length: usize) -> Self {
        self.max_name_length = max_name_length;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns current weather for `city`, from the cache when fresh.
    ///
    /// Every valid lookup is appended to the search history, hit or miss.
    pub fn get_cached_weather(&self, city: &str) -> Result<WeatherReport, LookupError> {
        let name = normalize_city_name(city, self.max_name_length)
            .ok_or_else(|| LookupError::InvalidCity(city.to_string()))?;
        let now = self.clock.now();
        self.history.append(&name, now)?;

        if let Some(weather) = self.cache.get(&name) {
            debug!(city = %name, "Weather cache hit");
            return Ok(report(name, weather, true));
        }

        self.cities.upsert(&name, now)?;
        match self.provider.fetch(&name, self.timeout) {
            Ok(weather) => {
                self.cache.insert(&name, weather.clone());
                self.cities.record_outcome(
                    &name,
                    RefreshStatus::Success,
                    None,
                    self.clock.now(),
                )?;
                Ok(report(name, weather, false))
            }
            Err(e) => {
                warn!(city = %name, error = %e, "Weather lookup failed");
                self.cities.record_outcome(
                    &name,
                    RefreshStatus::Failed,
                    Some(&e.to_string()),
                    self.clock.now(),
                )?;
                Err(LookupError::Provider(e))
            }
        }
    }

    pub fn recent_searches(&self, limit: u32) -> Result<Vec<SearchRecord>, LookupError> {
        Ok(self.history.recent(limit.clamp(1, 1000))?)
    }
}

fn report(city: String, weather: crate::models::Weather, cache_hit: bool) -> WeatherReport {
    WeatherReport {
        city,
        temperature: weather.temperature,
        condition: weather.condition,
        humidity: weather.humidity,
        cache_hit,
    }
}
