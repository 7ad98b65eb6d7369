//! The common result shape every provider adapter maps into.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::precision::Precision;
use crate::providers::ProviderId;
use crate::variants::VariantKind;

/// Outcome classification shared by all providers.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeocodeStatus {
    Ok,
    ZeroResults,
    OverQueryLimit,
    Error,
}

/// Current time in the ISO-8601 form we stamp on results and call logs.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// What one provider said about one query. Cached per (provider, query),
/// so this carries no row identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderReply {
    pub status: GeocodeStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub formatted_address: Option<String>,
    pub precision_level: Option<Precision>,
    /// The provider's own accuracy tag, kept for audit.
    pub precision_level_raw: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: String,
}

impl ProviderReply {
    /// A reply for a provider-level failure (transport, HTTP, parse, quota).
    pub fn failure(status: GeocodeStatus, error_message: impl Into<String>) -> ProviderReply {
        ProviderReply {
            status,
            latitude: None,
            longitude: None,
            formatted_address: None,
            precision_level: None,
            precision_level_raw: None,
            error_message: Some(error_message.into()),
            timestamp: iso_timestamp(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == GeocodeStatus::Ok
    }
}

/// One fully attributed geocoding result, tied back to its source row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub row_index: usize,
    pub status: GeocodeStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub formatted_address: Option<String>,
    pub precision_level: Option<Precision>,
    pub precision_level_raw: Option<String>,
    pub api_used: Option<ProviderId>,
    pub variant_kind: Option<VariantKind>,
    pub error_message: Option<String>,
    pub timestamp: String,
    /// Only set by retry runs: did this attempt beat the previous one?
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improved: Option<bool>,
}

impl GeocodeResult {
    /// A blank `ERROR` result for `row_index`, filled in by the engine.
    pub fn empty(row_index: usize) -> GeocodeResult {
        GeocodeResult {
            row_index,
            status: GeocodeStatus::Error,
            latitude: None,
            longitude: None,
            formatted_address: None,
            precision_level: None,
            precision_level_raw: None,
            api_used: None,
            variant_kind: None,
            error_message: None,
            timestamp: iso_timestamp(),
            improved: None,
        }
    }

    /// Attribute a provider reply to a row and the variant that produced it.
    pub fn from_reply(
        row_index: usize,
        reply: &ProviderReply,
        api_used: ProviderId,
        variant_kind: VariantKind,
    ) -> GeocodeResult {
        GeocodeResult {
            row_index,
            status: reply.status,
            latitude: reply.latitude,
            longitude: reply.longitude,
            formatted_address: reply.formatted_address.clone(),
            precision_level: reply.precision_level,
            precision_level_raw: reply.precision_level_raw.clone(),
            api_used: Some(api_used),
            variant_kind: Some(variant_kind),
            error_message: reply.error_message.clone(),
            timestamp: reply.timestamp.clone(),
            improved: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == GeocodeStatus::Ok
    }
}

/// The geocoding columns we append to output rows, in order.
pub const OUTPUT_COLUMNS: &[&str] = &[
    "status",
    "latitude",
    "longitude",
    "formatted_address",
    "precision_level",
    "precision_level_raw",
    "api_used",
    "variant_kind",
    "error_message",
    "timestamp",
];

/// Extra column appended by retry runs.
pub const IMPROVED_COLUMN: &str = "improved";

impl GeocodeResult {
    /// Column values matching [`OUTPUT_COLUMNS`], ready for a CSV writer.
    pub fn column_values(&self) -> Vec<String> {
        fn opt<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(|v| v.to_string()).unwrap_or_default()
        }
        vec![
            self.status.to_string(),
            opt(&self.latitude),
            opt(&self.longitude),
            self.formatted_address.clone().unwrap_or_default(),
            opt(&self.precision_level),
            self.precision_level_raw.clone().unwrap_or_default(),
            opt(&self.api_used),
            opt(&self.variant_kind),
            self.error_message.clone().unwrap_or_default(),
            self.timestamp.clone(),
        ]
    }

    /// The `improved` column value for retry output.
    pub fn improved_value(&self) -> String {
        match self.improved {
            Some(true) => "true".to_owned(),
            Some(false) => "false".to_owned(),
            None => String::new(),
        }
    }
}
