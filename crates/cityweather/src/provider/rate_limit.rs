//! A provider wrapper that spaces out upstream calls.
//!
//! One limiter is shared by every caller holding the same wrapper, so the
//! worker pool and the online lookup path draw from a single budget.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::{Clock as _, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use super::{ErrorKind, ProviderError, WeatherProvider};
use crate::models::Weather;

pub struct RateLimitedProvider {
    inner: Arc<dyn WeatherProvider>,
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
}

impl RateLimitedProvider {
    pub fn new(inner: Arc<dyn WeatherProvider>, requests_per_second: f64, burst: u32) -> Self {
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = (requests_per_second > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / requests_per_second));
        let quota = period
            .and_then(Quota::with_period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            inner,
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Blocks until a permit is available. Fails with `RateLimited` if the
    /// wait would run past `deadline`.
    fn acquire(&self, deadline: Instant) -> Result<(), ProviderError> {
        loop {
            match self.limiter.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    if Instant::now() + wait > deadline {
                        return Err(ProviderError::new(
                            ErrorKind::RateLimited,
                            "local request budget exhausted",
                        ));
                    }
                    std::thread::sleep(wait.max(Duration::from_millis(1)));
                }
            }
        }
    }
}

impl WeatherProvider for RateLimitedProvider {
    fn fetch(&self, city: &str, timeout: Duration) -> Result<Weather, ProviderError> {
        let deadline = Instant::now() + timeout;
        self.acquire(deadline)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.inner.fetch(city, remaining)
    }
}
