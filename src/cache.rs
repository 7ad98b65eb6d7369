//! Per-job response cache with single-flight semantics.
//!
//! One cache is created per job and discarded with it. The contract: for a
//! given `(provider, canonical_key)`, the underlying call runs at most
//! once; concurrent callers for the same key block until the first caller
//! finishes and then observe its reply.

use metrics::{counter, describe_counter};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::providers::ProviderId;
use crate::results::ProviderReply;

type Slot = Arc<OnceCell<ProviderReply>>;

pub struct ResponseCache {
    slots: Mutex<HashMap<(ProviderId, String), Slot>>,
}

impl ResponseCache {
    pub fn new() -> ResponseCache {
        describe_counter!("geofuse.cache_hits.total", "Queries answered from the cache");
        describe_counter!(
            "geofuse.cache_misses.total",
            "Queries that had to go out to a provider"
        );

        ResponseCache {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `(provider, key)`, invoking `call` only if no other caller
    /// has. Racing callers share one invocation and one reply.
    pub async fn get_or_call<F, Fut>(
        &self,
        provider: ProviderId,
        key: String,
        call: F,
    ) -> ProviderReply
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProviderReply>,
    {
        let slot: Slot = {
            let mut slots = self.slots.lock().expect("cache mutex poisoned");
            slots.entry((provider, key)).or_default().clone()
        };

        // The counter can race another caller initializing the same slot,
        // but that only skews metrics, not the single-flight guarantee.
        if slot.initialized() {
            counter!("geofuse.cache_hits.total", 1);
        } else {
            counter!("geofuse.cache_misses.total", 1);
        }

        slot.get_or_init(call).await.clone()
    }

    /// Distinct keys seen so far.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().expect("cache mutex poisoned").len()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        ResponseCache::new()
    }
}
