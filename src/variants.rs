//! Address rewriting: turning one input row into an ordered family of
//! query variants.
//!
//! This is a pure function of the row and the configured country bias; no
//! I/O happens here. Variant order matters: the fallback engine walks the
//! list front to back and stops at the first rooftop hit.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::config::CountryBias;
use crate::rows::AddressRecord;

/// Which rewrite produced a query.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Reformatted,
    NoName,
    Original,
    PlaceLookup,
    Structured,
}

/// Optional narrowing components sent alongside free-text queries, for
/// providers that accept them (Google).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Components {
    pub postal_code: Option<String>,
    pub locality: Option<String>,
    pub admin_area: Option<String>,
}

/// Separated sub-fields for providers with structured endpoints (OSM).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// The concrete payload handed to a provider adapter.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum QueryPayload {
    /// A single free-text address line.
    Text {
        address: String,
        components: Components,
    },
    /// A place-name lookup (name + locality), for place-search endpoints.
    Place { query: String },
    /// Separated address sub-fields.
    Structured(StructuredQuery),
}

/// One tagged query derived from a row.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub kind: VariantKind,
    pub payload: QueryPayload,
}

impl Variant {
    /// The canonical cache key for this payload. Two variants with the same
    /// canonical key would produce the same outbound request, so they share
    /// one cache slot per provider.
    pub fn canonical_key(&self) -> String {
        match &self.payload {
            QueryPayload::Text { address, components } => format!(
                "text:{}|{}|{}|{}",
                address,
                components.postal_code.as_deref().unwrap_or(""),
                components.locality.as_deref().unwrap_or(""),
                components.admin_area.as_deref().unwrap_or(""),
            ),
            QueryPayload::Place { query } => format!("place:{}", query),
            QueryPayload::Structured(q) => format!(
                "structured:{}|{}|{}|{}",
                q.street.as_deref().unwrap_or(""),
                q.city.as_deref().unwrap_or(""),
                q.postal_code.as_deref().unwrap_or(""),
                q.country.as_deref().unwrap_or(""),
            ),
        }
    }
}

lazy_static! {
    static ref LEADING_ZEROS: Regex = Regex::new(r"^0{1,3}").unwrap();
    static ref ZERO_PADDED_NUMBER: Regex = Regex::new(r"\b0\s+(\d+)").unwrap();
    static ref BUILDING_ABBREV: Regex = Regex::new(r"(?i)\b(?:IMM|IMMB|ILL)\b").unwrap();
    static ref RESIDENCE_ABBREV: Regex = Regex::new(r"(?i)\b(?:RES|RS)\b").unwrap();
    static ref STREET_TYPE_WORD: Regex =
        Regex::new(r"(?i)\b(?:Rue|Avenue|Av|Boulevard|Blvd|Résidence|Immeuble)\b").unwrap();
    static ref LEADING_HOUSE_NUMBER: Regex = Regex::new(r"^(\d{1,4})(\s*)(.*)$").unwrap();
}

/// Normalize a raw street line.
///
/// Strips leading zeros, de-pads `0 123` into `123`, expands the common
/// building abbreviations, and makes sure a street-type word is present
/// (prepending "Rue" when it isn't). Idempotent on already-normalized
/// streets.
pub fn reformat_street(street: &str) -> String {
    let street = street.trim();
    let street = LEADING_ZEROS.replace(street, "");
    let street = ZERO_PADDED_NUMBER.replace_all(&street, "$1");
    let street = BUILDING_ABBREV.replace_all(&street, "Immeuble");
    let street = RESIDENCE_ABBREV.replace_all(&street, "Résidence");

    if let Some(caps) = LEADING_HOUSE_NUMBER.captures(&street) {
        let number = &caps[1];
        let rest = &caps[3];
        if !STREET_TYPE_WORD.is_match(rest) {
            return format!("{} Rue {}", number, rest).trim().to_owned();
        }
    }
    if !STREET_TYPE_WORD.is_match(&street) {
        return format!("Rue {}", street.trim());
    }
    street.trim().to_owned()
}

/// Fold the accented characters providers routinely trip on, and append the
/// bias country when the address doesn't already mention it.
pub fn clean_full_address(address: &str, bias: &CountryBias) -> String {
    let mut address = address
        .replace('é', "e")
        .replace('è', "e")
        .replace('à', "a")
        .trim()
        .to_owned();
    if !address.contains(&bias.name) {
        address.push_str(", ");
        address.push_str(&bias.name);
    }
    address
}

/// Join non-empty parts with `", "`.
fn join_parts(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .filter_map(|part| *part)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Derive the ordered variant family for one row.
///
/// Produces, in priority order and omitting empty or duplicate entries:
/// reformatted, no_name, original, place_lookup, structured.
pub fn variants_for(record: &AddressRecord, bias: &CountryBias) -> Vec<Variant> {
    let mut variants = Vec::with_capacity(5);
    let mut seen_text: Vec<String> = Vec::with_capacity(3);

    let components = Components {
        postal_code: record.postal_code.clone(),
        locality: record.city.clone(),
        admin_area: record.governorate.clone(),
    };

    // The street drives the first two variants; rows that only carry a
    // full address still get a normalized line out of it.
    let street_source = record.street.as_deref().or(record.full_address.as_deref());
    let reformatted_street = street_source.map(reformat_street);

    // reformatted: normalized street plus the remaining fields.
    let reformatted = join_parts(&[
        record.name.as_deref(),
        reformatted_street.as_deref(),
        record.postal_code.as_deref(),
        record.city.as_deref(),
        record.governorate.as_deref(),
        record.country.as_deref(),
    ]);
    if !reformatted.is_empty() {
        seen_text.push(reformatted.clone());
        variants.push(Variant {
            kind: VariantKind::Reformatted,
            payload: QueryPayload::Text {
                address: reformatted,
                components: components.clone(),
            },
        });
    }

    // no_name: the same line without the establishment name.
    let no_name = join_parts(&[
        reformatted_street.as_deref(),
        record.postal_code.as_deref(),
        record.city.as_deref(),
        record.governorate.as_deref(),
        record.country.as_deref(),
    ]);
    if !no_name.is_empty() && !seen_text.contains(&no_name) {
        seen_text.push(no_name.clone());
        variants.push(Variant {
            kind: VariantKind::NoName,
            payload: QueryPayload::Text {
                address: no_name,
                components: components.clone(),
            },
        });
    }

    // original: the caller's own full address, lightly cleaned.
    if let Some(full) = record.full_address_or_synthesized() {
        let cleaned = clean_full_address(&full, bias);
        if !cleaned.is_empty() && !seen_text.contains(&cleaned) {
            variants.push(Variant {
                kind: VariantKind::Original,
                payload: QueryPayload::Text {
                    address: cleaned,
                    components,
                },
            });
        }
    }

    // place_lookup: establishment name plus a locality hint.
    if let Some(name) = &record.name {
        let query = match (&record.city, &record.country) {
            (Some(city), _) => format!("{}, {}", name, city),
            (None, Some(country)) => format!("{}, {}", name, country),
            (None, None) => name.clone(),
        };
        variants.push(Variant {
            kind: VariantKind::PlaceLookup,
            payload: QueryPayload::Place { query },
        });
    }

    // structured: raw sub-fields for providers that take them apart.
    if record.street.is_some() || record.city.is_some() {
        variants.push(Variant {
            kind: VariantKind::Structured,
            payload: QueryPayload::Structured(StructuredQuery {
                street: record.street.clone(),
                city: record.city.clone(),
                postal_code: record.postal_code.clone(),
                country: record.country.clone().or_else(|| Some(bias.name.clone())),
            }),
        });
    }

    variants
}
