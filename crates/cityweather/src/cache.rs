//! Shared TTL cache.
//!
//! moka bounds memory and evicts in the background on wall-clock time.
//! Freshness is decided separately against the injected [`Clock`], so an
//! entry read at or after its expiry is a miss even if moka still holds it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use moka::sync::Cache;

use crate::clock::Clock;
use crate::models::Weather;

const DEFAULT_MAX_ENTRIES: u64 = 100_000;

#[derive(Clone)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub struct TtlCache<V: Clone + Send + Sync + 'static> {
    entries: Cache<String, Entry<V>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

/// Cache of current conditions keyed by normalized city name.
pub type WeatherCache = TtlCache<Weather>;

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES, clock)
    }

    pub fn with_capacity(ttl: Duration, max_entries: u64, clock: Arc<dyn Clock>) -> Self {
        let mut builder = Cache::builder().max_capacity(max_entries);
        if let Ok(std_ttl) = ttl.to_std() {
            if !std_ttl.is_zero() {
                builder = builder.time_to_live(std_ttl);
            }
        }
        Self {
            entries: builder.build(),
            ttl,
            clock,
        }
    }

    /// Returns the value if it has not expired yet.
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        if self.clock.now() < entry.expires_at {
            Some(entry.value)
        } else {
            self.entries.invalidate(key);
            None
        }
    }

    /// Stores `value` under the default TTL.
    pub fn insert(&self, key: &str, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    pub fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(key);
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
