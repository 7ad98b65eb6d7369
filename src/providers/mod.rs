//! Geocoding provider adapters.

use async_trait::async_trait;
use futures::stream::StreamExt;
use hyper::{client::HttpConnector, Body, Client, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use url::Url;

use crate::cancel::CancelToken;
use crate::results::{GeocodeStatus, ProviderReply};
use crate::variants::{Variant, VariantKind};

pub mod google;
pub mod here;
pub mod osm;

pub use self::google::GoogleProvider;
pub use self::here::HereProvider;
pub use self::osm::OsmProvider;

/// A `hyper` client shared between multiple workers.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

pub fn shared_http_client(concurrency: usize) -> SharedHttpClient {
    // Create a shared `hyper::Client` with a connection pool, so that we can
    // use keep-alive.
    Arc::new(
        Client::builder().pool_max_idle_per_host(concurrency).build(
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .https_only()
                .enable_http2()
                .build(),
        ),
    )
}

/// The providers we know how to talk to.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Here,
    Google,
    Osm,
}

/// What query shapes a provider can answer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    pub free_text: bool,
    pub structured: bool,
    pub place_lookup: bool,
}

impl Capabilities {
    pub fn supports(&self, kind: VariantKind) -> bool {
        match kind {
            VariantKind::PlaceLookup => self.place_lookup,
            VariantKind::Structured => self.structured,
            VariantKind::Reformatted | VariantKind::NoName | VariantKind::Original => {
                self.free_text
            }
        }
    }
}

/// One geocoding backend, normalized to the common reply shape.
///
/// Adapters are infallible by type: every transport, HTTP, quota, and
/// parse failure is folded into `ProviderReply.status`, so callers never
/// see an `Err` for a provider-level problem.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn id(&self) -> ProviderId;

    fn capabilities(&self) -> Capabilities;

    /// True if this provider has the credentials it needs to make calls.
    fn has_credentials(&self) -> bool;

    /// Issue one geocoding request for `variant`.
    async fn geocode(&self, variant: &Variant, cancel: &CancelToken) -> ProviderReply;
}

/// Why a fetch failed, before classification into the common reply shape.
#[derive(Debug)]
pub(crate) enum FetchError {
    Cancelled,
    Timeout,
    Transport(String),
    Http(StatusCode, String),
    Parse(String),
}

impl FetchError {
    /// Fold this failure into the common reply shape, per the error
    /// taxonomy: quota exhaustion surfaces as `OVER_QUERY_LIMIT`,
    /// everything else as `ERROR`.
    pub(crate) fn into_reply(self) -> ProviderReply {
        match self {
            FetchError::Cancelled => ProviderReply::failure(GeocodeStatus::Error, "cancelled"),
            FetchError::Timeout => {
                ProviderReply::failure(GeocodeStatus::Error, "request timed out")
            }
            FetchError::Transport(message) => {
                ProviderReply::failure(GeocodeStatus::Error, message)
            }
            FetchError::Http(status, body) if status == StatusCode::TOO_MANY_REQUESTS => {
                ProviderReply::failure(
                    GeocodeStatus::OverQueryLimit,
                    format!("HTTP {}: {}", status, snippet(&body)),
                )
            }
            FetchError::Http(status, body) => ProviderReply::failure(
                GeocodeStatus::Error,
                format!("HTTP {}: {}", status, snippet(&body)),
            ),
            FetchError::Parse(message) => ProviderReply::failure(
                GeocodeStatus::Error,
                format!("could not parse response: {}", message),
            ),
        }
    }

}

/// Truncate a response body for error messages and logs.
fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_owned()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

/// `GET` a URL and parse the body as JSON, racing the per-request timeout
/// and the job's cancellation token.
pub(crate) async fn fetch_json(
    client: &SharedHttpClient,
    url: &Url,
    user_agent: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<serde_json::Value, FetchError> {
    let request = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header(hyper::header::USER_AGENT, user_agent)
        .body(Body::empty())
        .map_err(|err| FetchError::Transport(err.to_string()))?;

    let fetch = async {
        let response = client
            .request(request)
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let status = response.status();
        let mut body = response.into_body();
        let mut body_data = vec![];
        while let Some(chunk_result) = body.next().await {
            let chunk = chunk_result.map_err(|err| FetchError::Transport(err.to_string()))?;
            body_data.extend(&chunk[..]);
        }
        if !status.is_success() {
            return Err(FetchError::Http(
                status,
                String::from_utf8_lossy(&body_data).into_owned(),
            ));
        }
        serde_json::from_slice(&body_data).map_err(|err| FetchError::Parse(err.to_string()))
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        result = tokio::time::timeout(timeout, fetch) => match result {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchError::Timeout),
        },
    }
}

/// Record one finished provider call: metrics plus a structured entry in
/// the observability sink.
pub(crate) fn observe_call(
    call_log: &dyn crate::call_log::CallLog,
    provider: ProviderId,
    url: &Url,
    duration: Duration,
    reply: &ProviderReply,
) {
    metrics::histogram!(
        "geofuse.provider_call.duration_seconds",
        duration.as_secs_f64(),
        "provider" => provider.to_string()
    );
    metrics::counter!(
        "geofuse.provider_calls.total",
        1,
        "provider" => provider.to_string(),
        "outcome" => reply.status.to_string()
    );

    let mut record = crate::call_log::CallRecord::new(
        provider,
        redacted_url(url),
        reply.status.to_string(),
        duration.as_millis() as u64,
    );
    if let Some(error) = &reply.error_message {
        record = record.with_error(error.clone());
    }
    if reply.is_ok() {
        let summary = match (&reply.formatted_address, reply.precision_level) {
            (Some(address), Some(precision)) => format!("{} ({})", address, precision),
            (Some(address), None) => address.clone(),
            _ => reply.status.to_string(),
        };
        record = record.with_summary(summary);
    }
    call_log.record(record);
}

/// A URL rendered for logging, with credential parameters blanked.
pub(crate) fn redacted_url(url: &Url) -> String {
    const SECRET_PARAMS: &[&str] = &["key", "apiKey", "email"];
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if SECRET_PARAMS.contains(&k.as_ref()) {
                (k.into_owned(), "REDACTED".to_owned())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    let mut redacted = url.clone();
    {
        let mut serializer = redacted.query_pairs_mut();
        serializer.clear();
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
    }
    redacted.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_render_lowercase() {
        assert_eq!(ProviderId::Here.to_string(), "here");
        assert_eq!(ProviderId::Google.to_string(), "google");
        assert_eq!(ProviderId::Osm.to_string(), "osm");
    }

    #[test]
    fn capabilities_gate_variant_kinds() {
        let here = Capabilities {
            free_text: true,
            ..Capabilities::default()
        };
        assert!(here.supports(VariantKind::Reformatted));
        assert!(here.supports(VariantKind::Original));
        assert!(!here.supports(VariantKind::PlaceLookup));
        assert!(!here.supports(VariantKind::Structured));

        let google = Capabilities {
            free_text: true,
            place_lookup: true,
            ..Capabilities::default()
        };
        assert!(google.supports(VariantKind::PlaceLookup));
        assert!(!google.supports(VariantKind::Structured));
    }

    #[test]
    fn quota_http_status_maps_to_over_query_limit() {
        let reply =
            FetchError::Http(StatusCode::TOO_MANY_REQUESTS, "slow down".to_owned()).into_reply();
        assert_eq!(reply.status, GeocodeStatus::OverQueryLimit);

        let reply =
            FetchError::Http(StatusCode::INTERNAL_SERVER_ERROR, "boom".to_owned()).into_reply();
        assert_eq!(reply.status, GeocodeStatus::Error);
    }

    #[test]
    fn redaction_blanks_credentials_only() {
        let url = Url::parse(
            "https://geocode.search.hereapi.com/v1/geocode?q=tunis&apiKey=sekrit",
        )
        .unwrap();
        let redacted = redacted_url(&url);
        assert!(redacted.contains("q=tunis"));
        assert!(redacted.contains("apiKey=REDACTED"));
        assert!(!redacted.contains("sekrit"));
    }

    #[test]
    fn long_bodies_are_truncated_in_messages() {
        let body = "x".repeat(500);
        let reply = FetchError::Http(StatusCode::BAD_GATEWAY, body).into_reply();
        let message = reply.error_message.unwrap();
        assert!(message.len() < 300);
        assert!(message.starts_with("HTTP 502"));
    }
}
