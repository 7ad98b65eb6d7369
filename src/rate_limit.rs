//! Per-provider outbound rate limiting.

use leaky_bucket::RateLimiter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::providers::ProviderId;

/// Per-provider request spacing for one job.
///
/// Providers without an entry are unlimited. OSM always gets one: the
/// Nominatim usage policy allows at most one request per second across the
/// whole job.
pub struct RateGate {
    limiters: HashMap<ProviderId, Arc<RateLimiter>>,
}

impl RateGate {
    /// The standard gate: OSM spaced at `osm_interval`, everyone else
    /// unlimited.
    pub fn new(osm_interval: Duration) -> RateGate {
        let mut limiters = HashMap::new();
        limiters.insert(ProviderId::Osm, Self::spaced(osm_interval));
        RateGate { limiters }
    }

    /// A gate with an explicit interval per provider. Used by tests and
    /// available for configurations that also need to slow HERE or Google.
    pub fn with_intervals(intervals: &[(ProviderId, Duration)]) -> RateGate {
        let limiters = intervals
            .iter()
            .map(|(provider, interval)| (*provider, Self::spaced(*interval)))
            .collect();
        RateGate { limiters }
    }

    /// No limits at all.
    pub fn unlimited() -> RateGate {
        RateGate {
            limiters: HashMap::new(),
        }
    }

    fn spaced(interval: Duration) -> Arc<RateLimiter> {
        // One token, refilled once per interval: the first call goes out
        // immediately, every later call waits out the spacing. Since this
        // is all the same geocoding job, don't worry about fair scheduling
        // between different worker tasks.
        Arc::new(
            RateLimiter::builder()
                .initial(1)
                .max(1)
                .refill(1)
                .interval(interval)
                .fair(false)
                .build(),
        )
    }

    /// Wait for permission to call `provider`. Returns `false` if the job
    /// was cancelled while waiting.
    pub async fn acquire(&self, provider: ProviderId, cancel: &CancelToken) -> bool {
        let limiter = match self.limiters.get(&provider) {
            Some(limiter) => limiter.clone(),
            None => return !cancel.is_cancelled(),
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = limiter.acquire_one() => true,
        }
    }
}
