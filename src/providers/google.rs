//! Interface to the Google Geocoding and Places REST APIs.
//!
//! Free-text queries go straight to the Geocoding endpoint, narrowed by a
//! `components` filter built from the row. Place lookups are a two-step
//! dance: `findplacefromtext` resolves a `place_id`, which is then fed to
//! the Geocoding endpoint.

use async_trait::async_trait;
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
use crate::variants::{Components, QueryPayload, Variant};

use super::{
    fetch_json, observe_call, Capabilities, Provider, ProviderId, SharedHttpClient,
};

const GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const FIND_PLACE_URL: &str =
    "https://maps.googleapis.com/maps/api/place/findplacefromtext/json";

/// Map Google's `location_type` onto the common precision ladder.
pub fn map_google_precision(location_type: &str) -> Precision {
    match location_type {
        "ROOFTOP" => Precision::Rooftop,
        "RANGE_INTERPOLATED" => Precision::RangeInterpolated,
        "GEOMETRIC_CENTER" => Precision::GeometricCenter,
        "APPROXIMATE" => Precision::Approximate,
        _ => Precision::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResultJson>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResultJson {
    geometry: GeometryJson,
    formatted_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeometryJson {
    location: LocationJson,
    location_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocationJson {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct FindPlaceResponse {
    status: String,
    #[serde(default)]
    candidates: Vec<PlaceCandidate>,
}

#[derive(Debug, Deserialize)]
struct PlaceCandidate {
    place_id: Option<String>,
}

/// Geocoding interface for Google.
pub struct GoogleProvider {
    client: SharedHttpClient,
    api_key: Option<String>,
    bias_iso2: String,
    timeout: Duration,
    user_agent: String,
    call_log: Arc<dyn CallLog>,
}

impl GoogleProvider {
    pub fn new(
        config: &Config,
        client: SharedHttpClient,
        call_log: Arc<dyn CallLog>,
    ) -> GoogleProvider {
        GoogleProvider {
            client,
            api_key: config.google_api_key.clone(),
            bias_iso2: config.country_bias.iso2.clone(),
            timeout: config.request_timeout,
            user_agent: config.user_agent.clone(),
            call_log,
        }
    }

    fn geocode_url(&self, api_key: &str) -> Url {
        let mut url = Url::parse(GEOCODE_URL).expect("static URL must parse");
        url.query_pairs_mut()
            .append_pair("key", api_key)
            .append_pair("region", &self.bias_iso2.to_lowercase())
            .finish();
        url
    }

    /// One call to the Geocoding endpoint, already holding either an
    /// `address` + `components` pair or a `place_id`.
    async fn call_geocode(&self, url: Url, cancel: &CancelToken) -> ProviderReply {
        let start = Instant::now();
        let fetched =
            fetch_json(&self.client, &url, &self.user_agent, self.timeout, cancel).await;
        let duration = start.elapsed();

        let reply = match fetched {
            Err(err) => err.into_reply(),
            Ok(value) => match serde_json::from_value::<GeocodeResponse>(value) {
                Ok(response) => reply_from_response(response),
                Err(err) => ProviderReply::failure(
                    GeocodeStatus::Error,
                    format!("could not parse response: {}", err),
                ),
            },
        };
        observe_call(self.call_log.as_ref(), ProviderId::Google, &url, duration, &reply);
        reply
    }

    /// Resolve a free-text place query to a `place_id`, or a failure reply
    /// explaining why we couldn't.
    async fn find_place_id(
        &self,
        query: &str,
        api_key: &str,
        cancel: &CancelToken,
    ) -> Result<String, ProviderReply> {
        let mut url = Url::parse(FIND_PLACE_URL).expect("static URL must parse");
        url.query_pairs_mut()
            .append_pair("input", query)
            .append_pair("inputtype", "textquery")
            .append_pair("fields", "place_id")
            .append_pair("key", api_key)
            .finish();

        let start = Instant::now();
        let fetched =
            fetch_json(&self.client, &url, &self.user_agent, self.timeout, cancel).await;
        let duration = start.elapsed();

        let outcome = match fetched {
            Err(err) => Err(err.into_reply()),
            Ok(value) => match serde_json::from_value::<FindPlaceResponse>(value) {
                Err(err) => Err(ProviderReply::failure(
                    GeocodeStatus::Error,
                    format!("could not parse response: {}", err),
                )),
                Ok(response) => match provider_status(&response.status) {
                    GeocodeStatus::Ok => response
                        .candidates
                        .into_iter()
                        .filter_map(|c| c.place_id)
                        .next()
                        .ok_or_else(|| {
                            ProviderReply::failure(
                                GeocodeStatus::ZeroResults,
                                "no place match",
                            )
                        }),
                    status => Err(ProviderReply::failure(
                        status,
                        format!("place lookup status {}", response.status),
                    )),
                },
            },
        };

        // The find-place call is an outbound request in its own right, so
        // it gets its own log entry.
        let logged_reply = match &outcome {
            Ok(_) => ProviderReply {
                status: GeocodeStatus::Ok,
                latitude: None,
                longitude: None,
                formatted_address: None,
                precision_level: None,
                precision_level_raw: None,
                error_message: None,
                timestamp: crate::results::iso_timestamp(),
            },
            Err(reply) => reply.clone(),
        };
        observe_call(
            self.call_log.as_ref(),
            ProviderId::Google,
            &url,
            duration,
            &logged_reply,
        );
        outcome
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Google
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            free_text: true,
            // Structured narrowing rides along as a `components` filter on
            // free-text queries; the dedicated structured variant is OSM's.
            structured: false,
            place_lookup: true,
        }
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(name = "GoogleProvider::geocode", level = "debug", skip_all)]
    async fn geocode(&self, variant: &Variant, cancel: &CancelToken) -> ProviderReply {
        let api_key = match &self.api_key {
            Some(key) => key.clone(),
            None => return ProviderReply::failure(GeocodeStatus::Error, "no credentials"),
        };

        match &variant.payload {
            QueryPayload::Text { address, components } => {
                let mut url = self.geocode_url(&api_key);
                url.query_pairs_mut()
                    .append_pair("address", address)
                    .append_pair(
                        "components",
                        &components_filter(&self.bias_iso2, components),
                    )
                    .finish();
                self.call_geocode(url, cancel).await
            }
            QueryPayload::Place { query } => {
                let place_id = match self.find_place_id(query, &api_key, cancel).await {
                    Ok(place_id) => place_id,
                    Err(reply) => return reply,
                };
                let mut url = self.geocode_url(&api_key);
                url.query_pairs_mut().append_pair("place_id", &place_id).finish();
                self.call_geocode(url, cancel).await
            }
            QueryPayload::Structured(_) => ProviderReply::failure(
                GeocodeStatus::Error,
                "Google takes structured fields as a components filter, not a structured query",
            ),
        }
    }
}

/// The `components` filter: always the bias country, plus whatever the
/// row supplied.
fn components_filter(bias_iso2: &str, components: &Components) -> String {
    let mut parts = vec![format!("country:{}", bias_iso2)];
    if let Some(postal_code) = &components.postal_code {
        parts.push(format!("postal_code:{}", postal_code));
    }
    if let Some(locality) = &components.locality {
        parts.push(format!("locality:{}", locality));
    }
    if let Some(admin_area) = &components.admin_area {
        parts.push(format!("administrative_area_level_1:{}", admin_area));
    }
    parts.join("|")
}

/// Map Google's response-level `status` string onto the common statuses.
fn provider_status(status: &str) -> GeocodeStatus {
    match status {
        "OK" => GeocodeStatus::Ok,
        "ZERO_RESULTS" => GeocodeStatus::ZeroResults,
        "OVER_QUERY_LIMIT" => GeocodeStatus::OverQueryLimit,
        _ => GeocodeStatus::Error,
    }
}

fn reply_from_response(response: GeocodeResponse) -> ProviderReply {
    match provider_status(&response.status) {
        GeocodeStatus::Ok => {
            let result = match response.results.into_iter().next() {
                Some(result) => result,
                None => {
                    return ProviderReply::failure(
                        GeocodeStatus::Error,
                        "could not parse response: status OK with no results",
                    )
                }
            };
            let location = result.geometry.location;
            if !location.lat.is_finite() || !location.lng.is_finite() {
                return ProviderReply::failure(
                    GeocodeStatus::Error,
                    "could not parse response: non-finite coordinates",
                );
            }
            ProviderReply {
                status: GeocodeStatus::Ok,
                latitude: Some(location.lat),
                longitude: Some(location.lng),
                formatted_address: result.formatted_address,
                precision_level: Some(
                    result
                        .geometry
                        .location_type
                        .as_deref()
                        .map(map_google_precision)
                        .unwrap_or(Precision::Unknown),
                ),
                precision_level_raw: result.geometry.location_type,
                error_message: None,
                timestamp: crate::results::iso_timestamp(),
            }
        }
        status => ProviderReply::failure(
            status,
            response
                .error_message
                .clone()
                .unwrap_or_else(|| format!("status {}", response.status)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_mapping_matches_the_contract() {
        assert_eq!(map_google_precision("ROOFTOP"), Precision::Rooftop);
        assert_eq!(
            map_google_precision("RANGE_INTERPOLATED"),
            Precision::RangeInterpolated
        );
        assert_eq!(map_google_precision("GEOMETRIC_CENTER"), Precision::GeometricCenter);
        assert_eq!(map_google_precision("APPROXIMATE"), Precision::Approximate);
        assert_eq!(map_google_precision("SOMETHING_ELSE"), Precision::Unknown);
    }

    #[test]
    fn ok_response_parses_into_reply() {
        let json = serde_json::json!({
            "status": "OK",
            "results": [{
                "geometry": {
                    "location": { "lat": 36.8, "lng": 10.18 },
                    "location_type": "ROOFTOP"
                },
                "formatted_address": "Avenue Habib Bourguiba, Tunis, Tunisia"
            }]
        });
        let response: GeocodeResponse = serde_json::from_value(json).unwrap();
        let reply = reply_from_response(response);
        assert_eq!(reply.status, GeocodeStatus::Ok);
        assert_eq!(reply.precision_level, Some(Precision::Rooftop));
        assert_eq!(reply.precision_level_raw.as_deref(), Some("ROOFTOP"));
    }

    #[test]
    fn zero_results_and_quota_statuses_pass_through() {
        let zero: GeocodeResponse =
            serde_json::from_value(serde_json::json!({ "status": "ZERO_RESULTS" })).unwrap();
        assert_eq!(reply_from_response(zero).status, GeocodeStatus::ZeroResults);

        let quota: GeocodeResponse = serde_json::from_value(serde_json::json!({
            "status": "OVER_QUERY_LIMIT",
            "error_message": "You have exceeded your daily request quota"
        }))
        .unwrap();
        let reply = reply_from_response(quota);
        assert_eq!(reply.status, GeocodeStatus::OverQueryLimit);
        assert!(reply.error_message.unwrap().contains("quota"));
    }

    #[test]
    fn unexpected_status_is_an_error() {
        let denied: GeocodeResponse = serde_json::from_value(serde_json::json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid"
        }))
        .unwrap();
        let reply = reply_from_response(denied);
        assert_eq!(reply.status, GeocodeStatus::Error);
        assert!(reply.error_message.unwrap().contains("invalid"));
    }

    #[test]
    fn components_filter_always_leads_with_country() {
        let filter = components_filter(
            "TN",
            &Components {
                postal_code: Some("1000".to_owned()),
                locality: Some("Tunis".to_owned()),
                admin_area: None,
            },
        );
        assert_eq!(filter, "country:TN|postal_code:1000|locality:Tunis");
        assert_eq!(components_filter("TN", &Components::default()), "country:TN");
    }
}
