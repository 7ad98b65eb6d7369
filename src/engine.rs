//! The fallback engine: for one row, walk providers and variants until a
//! good-enough result turns up, tracking the best seen along the way.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tracing::{debug, trace};

use crate::cache::ResponseCache;
use crate::cancel::CancelToken;
use crate::config::{Config, CountryBias};
use crate::precision::{Precision, ResultComparator};
use crate::providers::{Provider, ProviderId};
use crate::rate_limit::RateGate;
use crate::results::{GeocodeResult, GeocodeStatus, ProviderReply};
use crate::rows::AddressRecord;
use crate::variants::{variants_for, Variant};

/// Which providers a batch may consult.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    HereOnly,
    GoogleOnly,
    OsmOnly,
    Multi,
}

impl RunMode {
    fn allows(self, provider: ProviderId) -> bool {
        match self {
            RunMode::HereOnly => provider == ProviderId::Here,
            RunMode::GoogleOnly => provider == ProviderId::Google,
            RunMode::OsmOnly => provider == ProviderId::Osm,
            RunMode::Multi => true,
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Multi
    }
}

/// What a previous run said about a row, for retry ordering and the
/// `improved` flag.
#[derive(Clone, Debug)]
pub struct PriorAttempt {
    pub api_used: Option<ProviderId>,
    pub status: GeocodeStatus,
    pub precision: Option<Precision>,
}

/// Providers that must not be called again within this job, either because
/// they reported quota exhaustion or because they have no credentials.
#[derive(Default)]
struct SuppressionLedger {
    here: AtomicBool,
    google: AtomicBool,
    osm: AtomicBool,
}

impl SuppressionLedger {
    fn flag(&self, provider: ProviderId) -> &AtomicBool {
        match provider {
            ProviderId::Here => &self.here,
            ProviderId::Google => &self.google,
            ProviderId::Osm => &self.osm,
        }
    }

    fn suppress(&self, provider: ProviderId) {
        self.flag(provider).store(true, Ordering::Relaxed);
    }

    fn is_suppressed(&self, provider: ProviderId) -> bool {
        self.flag(provider).load(Ordering::Relaxed)
    }
}

/// One job's geocoding state: providers, cache, rate limiter, and the
/// suppression ledger. Created per job, discarded with it.
pub struct Orchestrator {
    providers: Vec<Arc<dyn Provider>>,
    cache: ResponseCache,
    rate: RateGate,
    suppressed: SuppressionLedger,
    comparator: ResultComparator,
    bias: CountryBias,
}

impl Orchestrator {
    /// Build an orchestrator over the given providers. The provider order
    /// is the preference order for `multi` mode and for tie-breaking.
    pub fn new(config: &Config, providers: Vec<Arc<dyn Provider>>) -> Orchestrator {
        let preference: Vec<ProviderId> = providers.iter().map(|p| p.id()).collect();
        Orchestrator {
            providers,
            cache: ResponseCache::new(),
            rate: RateGate::new(config.osm_interval),
            suppressed: SuppressionLedger::default(),
            comparator: ResultComparator::new(preference),
            bias: config.country_bias.clone(),
        }
    }

    /// Swap in a custom rate gate. Used by tests to shrink the intervals.
    #[cfg(test)]
    fn with_rate_gate(mut self, rate: RateGate) -> Orchestrator {
        self.rate = rate;
        self
    }

    /// Geocode one fresh row.
    pub async fn geocode_row(
        &self,
        row_index: usize,
        record: &AddressRecord,
        mode: RunMode,
        cancel: &CancelToken,
    ) -> GeocodeResult {
        self.geocode_inner(row_index, record, mode, None, cancel).await
    }

    /// Re-geocode a previously attempted row: the provider that answered
    /// last time goes last, and the result carries the `improved` flag.
    pub async fn retry_row(
        &self,
        row_index: usize,
        record: &AddressRecord,
        prior: &PriorAttempt,
        mode: RunMode,
        cancel: &CancelToken,
    ) -> GeocodeResult {
        let mut result = self
            .geocode_inner(row_index, record, mode, Some(prior), cancel)
            .await;
        result.improved = Some(improved(&result, prior));
        result
    }

    /// Providers to try for a row, in order.
    fn provider_order(
        &self,
        mode: RunMode,
        prior: Option<&PriorAttempt>,
    ) -> Vec<Arc<dyn Provider>> {
        let mut order: Vec<Arc<dyn Provider>> = self
            .providers
            .iter()
            .filter(|p| mode.allows(p.id()))
            .cloned()
            .collect();
        if let Some(used) = prior.and_then(|p| p.api_used) {
            if let Some(pos) = order.iter().position(|p| p.id() == used) {
                let previously_used = order.remove(pos);
                order.push(previously_used);
            }
        }
        order
    }

    async fn geocode_inner(
        &self,
        row_index: usize,
        record: &AddressRecord,
        mode: RunMode,
        prior: Option<&PriorAttempt>,
        cancel: &CancelToken,
    ) -> GeocodeResult {
        if cancel.is_cancelled() {
            return cancelled_result(row_index);
        }

        let variants = variants_for(record, &self.bias);
        let order = self.provider_order(mode, prior);
        let mut best: Option<GeocodeResult> = None;
        let mut last_failure: Option<GeocodeResult> = None;

        'providers: for provider in &order {
            if best_is_final(&best) {
                break;
            }
            let provider_id = provider.id();
            if self.suppressed.is_suppressed(provider_id) {
                continue;
            }
            if !provider.has_credentials() {
                debug!("skipping {} permanently: no credentials", provider_id);
                self.suppressed.suppress(provider_id);
                let mut failure = GeocodeResult::empty(row_index);
                failure.api_used = Some(provider_id);
                failure.error_message = Some("no credentials".to_owned());
                last_failure = Some(failure);
                continue;
            }

            for variant in &variants {
                if !provider.capabilities().supports(variant.kind) {
                    continue;
                }
                if cancel.is_cancelled() {
                    return cancelled_result(row_index);
                }
                if self.suppressed.is_suppressed(provider_id) {
                    continue 'providers;
                }

                let reply = self.cached_call(provider, variant, cancel).await;
                if cancel.is_cancelled() {
                    return cancelled_result(row_index);
                }
                trace!(
                    "row {}: {} answered {} for {:?}",
                    row_index,
                    provider_id,
                    reply.status,
                    variant.kind
                );

                let result =
                    GeocodeResult::from_reply(row_index, &reply, provider_id, variant.kind);
                if result.is_ok() {
                    if self.comparator.is_better(&result, best.as_ref()) {
                        best = Some(result);
                    }
                    if best_is_final(&best) {
                        break 'providers;
                    }
                } else {
                    let was_quota = reply.status == GeocodeStatus::OverQueryLimit;
                    if was_quota {
                        debug!("suppressing {} for the rest of the job: quota", provider_id);
                        self.suppressed.suppress(provider_id);
                    }
                    last_failure = Some(result);
                    if was_quota {
                        continue 'providers;
                    }
                }
            }
        }

        match best {
            Some(best) => best,
            None => no_result(row_index, last_failure),
        }
    }

    /// One provider call, routed through the cache and the rate limiter.
    /// Only the caller that actually goes out pays the rate-limit wait.
    async fn cached_call(
        &self,
        provider: &Arc<dyn Provider>,
        variant: &Variant,
        cancel: &CancelToken,
    ) -> ProviderReply {
        let key = variant.canonical_key().to_lowercase();
        self.cache
            .get_or_call(provider.id(), key, || async {
                if !self.rate.acquire(provider.id(), cancel).await {
                    return ProviderReply::failure(GeocodeStatus::Error, "cancelled");
                }
                provider.geocode(variant, cancel).await
            })
            .await
    }
}

fn best_is_final(best: &Option<GeocodeResult>) -> bool {
    best.as_ref()
        .and_then(|b| b.precision_level)
        .map(Precision::is_final)
        .unwrap_or(false)
}

pub(crate) fn cancelled_result(row_index: usize) -> GeocodeResult {
    let mut result = GeocodeResult::empty(row_index);
    result.error_message = Some("cancelled".to_owned());
    result
}

/// The terminal `ERROR` result when no provider produced anything usable.
fn no_result(row_index: usize, last_failure: Option<GeocodeResult>) -> GeocodeResult {
    let mut result = GeocodeResult::empty(row_index);
    match last_failure {
        Some(failure) => {
            result.error_message = Some(match (&failure.api_used, &failure.error_message) {
                (Some(provider), Some(message)) => format!(
                    "no provider produced a result (last failure from {}: {})",
                    provider, message
                ),
                (_, Some(message)) => {
                    format!("no provider produced a result (last failure: {})", message)
                }
                _ => "no provider produced a result".to_owned(),
            });
            // Reuse the failure's timestamp so a warm-cache rerun emits
            // byte-identical results.
            result.timestamp = failure.timestamp;
        }
        None => {
            result.error_message = Some("no provider produced a result".to_owned());
        }
    }
    result
}

/// Did a retry beat the previous attempt?
fn improved(result: &GeocodeResult, prior: &PriorAttempt) -> bool {
    result.is_ok()
        && (prior.status != GeocodeStatus::Ok || result.precision_level > prior.precision)
}
