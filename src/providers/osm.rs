//! Interface to OSM Nominatim.
//!
//! Nominatim's usage policy requires an identifying `User-Agent`, a contact
//! email parameter, and at most one request per second. The spacing is
//! enforced upstream by the per-provider rate limiter; this adapter only
//! handles the request shape.

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
use crate::variants::{QueryPayload, StructuredQuery, Variant};

use super::{
    fetch_json, observe_call, Capabilities, Provider, ProviderId, SharedHttpClient,
};

const NOMINATIM_SEARCH_URL: &str = "https://nominatim.openstreetmap.org/search";

/// Map a Nominatim `type` (or `class`) tag onto the common precision
/// ladder, when the tag is one we recognize.
fn classify_osm_tag(tag: &str) -> Option<Precision> {
    match tag {
        "house" | "building" | "address" | "residential" | "apartments" | "shop"
        | "amenity" | "office" => Some(Precision::Rooftop),
        "road" | "street" | "path" => Some(Precision::RangeInterpolated),
        "neighbourhood" | "suburb" | "quarter" | "district" => {
            Some(Precision::GeometricCenter)
        }
        "city" | "town" | "village" | "municipality" | "county" | "state" | "region" => {
            Some(Precision::Approximate)
        }
        _ => None,
    }
}

/// Full mapping: `type` first, then `class`, then the mapped default.
/// A hit with no tag at all is `UNKNOWN`.
pub fn map_osm_precision(osm_type: Option<&str>, osm_class: Option<&str>) -> Precision {
    match osm_type {
        None => Precision::Unknown,
        Some(tag) => classify_osm_tag(&tag.to_lowercase())
            .or_else(|| osm_class.and_then(|c| classify_osm_tag(&c.to_lowercase())))
            .unwrap_or(Precision::GeometricCenter),
    }
}

#[derive(Debug, Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
    display_name: Option<String>,
    #[serde(rename = "type")]
    osm_type: Option<String>,
    class: Option<String>,
}

/// Geocoding interface for OSM Nominatim.
pub struct OsmProvider {
    client: SharedHttpClient,
    email: Option<String>,
    timeout: Duration,
    user_agent: String,
    call_log: Arc<dyn CallLog>,
}

impl OsmProvider {
    pub fn new(
        config: &Config,
        client: SharedHttpClient,
        call_log: Arc<dyn CallLog>,
    ) -> OsmProvider {
        OsmProvider {
            client,
            email: config.osm_email.clone(),
            timeout: config.request_timeout,
            user_agent: config.user_agent.clone(),
            call_log,
        }
    }

    fn base_url(&self, email: &str) -> Url {
        let mut url = Url::parse(NOMINATIM_SEARCH_URL).expect("static URL must parse");
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("addressdetails", "1")
            .append_pair("limit", "1")
            .append_pair("email", email)
            .finish();
        url
    }

    fn structured_url(&self, query: &StructuredQuery, email: &str) -> Url {
        let mut url = self.base_url(email);
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(street) = &query.street {
                pairs.append_pair("street", street);
            }
            if let Some(city) = &query.city {
                pairs.append_pair("city", city);
            }
            if let Some(postal_code) = &query.postal_code {
                pairs.append_pair("postalcode", postal_code);
            }
            if let Some(country) = &query.country {
                pairs.append_pair("country", country);
            }
            pairs.finish();
        }
        url
    }
}

#[async_trait]
impl Provider for OsmProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Osm
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            free_text: true,
            structured: true,
            place_lookup: false,
        }
    }

    fn has_credentials(&self) -> bool {
        // Nominatim has no API key, but the usage policy requires a contact
        // email; treat a missing one as a missing credential.
        self.email.is_some()
    }

    #[instrument(name = "OsmProvider::geocode", level = "debug", skip_all)]
    async fn geocode(&self, variant: &Variant, cancel: &CancelToken) -> ProviderReply {
        let email = match &self.email {
            Some(email) => email.clone(),
            None => return ProviderReply::failure(GeocodeStatus::Error, "no credentials"),
        };

        let url = match &variant.payload {
            QueryPayload::Text { address, .. } => {
                let mut url = self.base_url(&email);
                url.query_pairs_mut().append_pair("q", address).finish();
                url
            }
            QueryPayload::Structured(query) => self.structured_url(query, &email),
            QueryPayload::Place { .. } => {
                return ProviderReply::failure(
                    GeocodeStatus::Error,
                    "Nominatim has no place-id lookup",
                )
            }
        };

        let start = Instant::now();
        let fetched =
            fetch_json(&self.client, &url, &self.user_agent, self.timeout, cancel).await;
        let duration = start.elapsed();

        let reply = match fetched {
            Err(err) => err.into_reply(),
            Ok(value) => match serde_json::from_value::<Vec<NominatimHit>>(value) {
                Ok(hits) => reply_from_hits(hits),
                Err(err) => ProviderReply::failure(
                    GeocodeStatus::Error,
                    format!("could not parse response: {}", err),
                ),
            },
        };
        observe_call(self.call_log.as_ref(), ProviderId::Osm, &url, duration, &reply);
        reply
    }
}

fn reply_from_hits(hits: Vec<NominatimHit>) -> ProviderReply {
    let hit = match hits.into_iter().next() {
        Some(hit) => hit,
        None => {
            return ProviderReply::failure(GeocodeStatus::ZeroResults, "No results from OSM")
        }
    };
    // Nominatim serializes coordinates as strings.
    let latitude = hit.lat.parse::<f64>();
    let longitude = hit.lon.parse::<f64>();
    let (latitude, longitude) = match (latitude, longitude) {
        (Ok(lat), Ok(lon)) if lat.is_finite() && lon.is_finite() => (lat, lon),
        _ => {
            return ProviderReply::failure(
                GeocodeStatus::Error,
                "could not parse response: bad coordinates",
            )
        }
    };
    let precision =
        map_osm_precision(hit.osm_type.as_deref(), hit.class.as_deref());
    ProviderReply {
        status: GeocodeStatus::Ok,
        latitude: Some(latitude),
        longitude: Some(longitude),
        formatted_address: hit.display_name,
        precision_level: Some(precision),
        precision_level_raw: hit.osm_type,
        error_message: None,
        timestamp: crate::results::iso_timestamp(),
    }
}
