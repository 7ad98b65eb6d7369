//! Interface to the HERE Geocoding & Search v1 REST API.

use async_trait::async_trait;
use metrics::{describe_counter, describe_histogram, Unit};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;
use url::Url;

use crate::call_log::CallLog;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::precision::Precision;
use crate::results::{GeocodeStatus, ProviderReply};
use crate::variants::{QueryPayload, Variant};

use super::{
    fetch_json, observe_call, Capabilities, Provider, ProviderId, SharedHttpClient,
};

const HERE_GEOCODE_URL: &str = "https://geocode.search.hereapi.com/v1/geocode";

/// Map HERE's `resultType` onto the common precision ladder.
pub fn map_here_precision(result_type: &str) -> Precision {
    match result_type.to_lowercase().as_str() {
        "housenumber" => Precision::Rooftop,
        "intersection" | "street" => Precision::RangeInterpolated,
        "postalcode" => Precision::GeometricCenter,
        "city" | "locality" | "district" | "county" | "state" | "place" | "country"
        | "administrativearea" => Precision::Approximate,
        _ => Precision::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct HereResponse {
    #[serde(default)]
    items: Vec<HereItem>,
}

#[derive(Debug, Deserialize)]
struct HereItem {
    position: Option<HerePosition>,
    address: Option<HereAddress>,
    #[serde(rename = "resultType")]
    result_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HerePosition {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct HereAddress {
    label: Option<String>,
}

/// Geocoding interface for HERE.
pub struct HereProvider {
    client: SharedHttpClient,
    api_key: Option<String>,
    bias_iso3: String,
    timeout: Duration,
    user_agent: String,
    call_log: Arc<dyn CallLog>,
}

impl HereProvider {
    pub fn new(
        config: &Config,
        client: SharedHttpClient,
        call_log: Arc<dyn CallLog>,
    ) -> HereProvider {
        describe_counter!(
            "geofuse.provider_calls.total",
            "Outbound provider calls, by provider and outcome"
        );
        describe_histogram!(
            "geofuse.provider_call.duration_seconds",
            Unit::Seconds,
            "Time spent on one outbound provider request"
        );

        HereProvider {
            client,
            api_key: config.here_api_key.clone(),
            bias_iso3: config.country_bias.iso3.clone(),
            timeout: config.request_timeout,
            user_agent: config.user_agent.clone(),
            call_log,
        }
    }

    fn build_url(&self, address: &str, api_key: &str) -> Url {
        let mut url = Url::parse(HERE_GEOCODE_URL).expect("static URL must parse");
        url.query_pairs_mut()
            .append_pair("q", address)
            .append_pair("apiKey", api_key)
            .append_pair("in", &format!("countryCode:{}", self.bias_iso3))
            .finish();
        url
    }
}

#[async_trait]
impl Provider for HereProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Here
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            free_text: true,
            structured: false,
            place_lookup: false,
        }
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(name = "HereProvider::geocode", level = "debug", skip_all)]
    async fn geocode(&self, variant: &Variant, cancel: &CancelToken) -> ProviderReply {
        let api_key = match &self.api_key {
            Some(key) => key,
            None => return ProviderReply::failure(GeocodeStatus::Error, "no credentials"),
        };
        let address = match &variant.payload {
            QueryPayload::Text { address, .. } => address,
            _ => {
                return ProviderReply::failure(
                    GeocodeStatus::Error,
                    "HERE only answers free-text queries",
                )
            }
        };

        let url = self.build_url(address, api_key);
        let start = Instant::now();
        let fetched =
            fetch_json(&self.client, &url, &self.user_agent, self.timeout, cancel).await;
        let duration = start.elapsed();

        let reply = match fetched {
            Err(err) => err.into_reply(),
            Ok(value) => match serde_json::from_value::<HereResponse>(value) {
                Ok(response) => reply_from_items(response.items),
                Err(err) => ProviderReply::failure(
                    GeocodeStatus::Error,
                    format!("could not parse response: {}", err),
                ),
            },
        };
        observe_call(self.call_log.as_ref(), ProviderId::Here, &url, duration, &reply);
        reply
    }
}

fn reply_from_items(items: Vec<HereItem>) -> ProviderReply {
    let item = match items.into_iter().next() {
        Some(item) => item,
        None => {
            return ProviderReply::failure(
                GeocodeStatus::ZeroResults,
                "No results from HERE Maps",
            )
        }
    };
    let position = match item.position {
        Some(position) => position,
        None => {
            return ProviderReply::failure(
                GeocodeStatus::Error,
                "could not parse response: item without position",
            )
        }
    };
    if !position.lat.is_finite() || !position.lng.is_finite() {
        return ProviderReply::failure(
            GeocodeStatus::Error,
            "could not parse response: non-finite coordinates",
        );
    }
    ProviderReply {
        status: GeocodeStatus::Ok,
        latitude: Some(position.lat),
        longitude: Some(position.lng),
        formatted_address: item.address.and_then(|a| a.label),
        precision_level: Some(
            item.result_type
                .as_deref()
                .map(map_here_precision)
                .unwrap_or(Precision::Unknown),
        ),
        precision_level_raw: item.result_type,
        error_message: None,
        timestamp: crate::results::iso_timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_mapping_matches_the_contract() {
        assert_eq!(map_here_precision("houseNumber"), Precision::Rooftop);
        assert_eq!(map_here_precision("intersection"), Precision::RangeInterpolated);
        assert_eq!(map_here_precision("street"), Precision::RangeInterpolated);
        assert_eq!(map_here_precision("postalCode"), Precision::GeometricCenter);
        assert_eq!(map_here_precision("city"), Precision::Approximate);
        assert_eq!(map_here_precision("administrativeArea"), Precision::Approximate);
        assert_eq!(map_here_precision("somethingNew"), Precision::Unknown);
    }

    #[test]
    fn precision_mapping_is_pure() {
        for raw in &["houseNumber", "street", "city", "weird"] {
            assert_eq!(map_here_precision(raw), map_here_precision(raw));
        }
    }

    #[test]
    fn items_parse_into_ok_reply() {
        let json = serde_json::json!({
            "items": [{
                "position": { "lat": 36.800, "lng": 10.180 },
                "address": { "label": "12 Avenue Habib Bourguiba, Tunis" },
                "resultType": "houseNumber"
            }]
        });
        let response: HereResponse = serde_json::from_value(json).unwrap();
        let reply = reply_from_items(response.items);
        assert_eq!(reply.status, GeocodeStatus::Ok);
        assert_eq!(reply.latitude, Some(36.800));
        assert_eq!(reply.precision_level, Some(Precision::Rooftop));
        assert_eq!(reply.precision_level_raw.as_deref(), Some("houseNumber"));
    }

    #[test]
    fn empty_items_is_zero_results() {
        let reply = reply_from_items(vec![]);
        assert_eq!(reply.status, GeocodeStatus::ZeroResults);
        assert!(reply.latitude.is_none());
    }

    #[test]
    fn item_without_position_is_a_parse_error() {
        let json = serde_json::json!({ "items": [{ "resultType": "street" }] });
        let response: HereResponse = serde_json::from_value(json).unwrap();
        let reply = reply_from_items(response.items);
        assert_eq!(reply.status, GeocodeStatus::Error);
        assert!(reply.error_message.unwrap().contains("parse"));
    }
}
