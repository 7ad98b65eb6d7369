//! Types related to input rows and the semantic field mapping.

use anyhow::{format_err, Context};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    path::Path,
};

use crate::Result;

/// The semantic address fields of one input row, extracted through the
/// caller's field mapping. Every field is optional; blank column values
/// are treated as absent.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub governorate: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub complement: Option<String>,
    /// The caller-provided full address, when a column carries one.
    #[serde(default)]
    pub full_address: Option<String>,
}

impl AddressRecord {
    /// The full address: the mapped column when present, otherwise the
    /// mapped fields joined with `", "` in a fixed order.
    pub fn full_address_or_synthesized(&self) -> Option<String> {
        if let Some(full) = &self.full_address {
            return Some(full.clone());
        }
        let parts: Vec<&str> = [
            &self.name,
            &self.street,
            &self.postal_code,
            &self.city,
            &self.governorate,
            &self.country,
            &self.complement,
        ]
        .iter()
        .filter_map(|field| field.as_deref())
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// Trim a raw column value, mapping blanks to `None`.
fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// A mapping from the semantic field names to the caller's columns.
///
/// `K` is typically either a `String` (for a column name) or a `usize` (for a
/// column index).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FieldMapping<K: Eq> {
    #[serde(default = "Option::default")]
    pub name: Option<K>,
    #[serde(default = "Option::default")]
    pub street: Option<K>,
    #[serde(default = "Option::default", alias = "postcode")]
    pub postal_code: Option<K>,
    #[serde(default = "Option::default")]
    pub city: Option<K>,
    #[serde(default = "Option::default", alias = "state")]
    pub governorate: Option<K>,
    #[serde(default = "Option::default")]
    pub country: Option<K>,
    #[serde(default = "Option::default")]
    pub complement: Option<K>,
    #[serde(default = "Option::default", alias = "address")]
    pub full_address: Option<K>,
}

impl<K: Eq> FieldMapping<K> {
    /// All mapped columns, in declaration order.
    fn columns(&self) -> Vec<&K> {
        [
            &self.name,
            &self.street,
            &self.postal_code,
            &self.city,
            &self.governorate,
            &self.country,
            &self.complement,
            &self.full_address,
        ]
        .iter()
        .filter_map(|column| column.as_ref())
        .collect()
    }

    /// A mapping with no columns at all geocodes nothing; reject it early.
    pub fn validate(&self) -> Result<()> {
        if self.columns().is_empty() {
            return Err(format_err!("field mapping does not map any columns"));
        }
        Ok(())
    }
}

impl FieldMapping<String> {
    /// Load a `FieldMapping` from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let f = File::open(path)
            .with_context(|| format_err!("cannot open {}", path.display()))?;
        let mapping: FieldMapping<String> = serde_json::from_reader(f)
            .with_context(|| format_err!("error parsing {}", path.display()))?;
        mapping.validate()?;
        Ok(mapping)
    }

    /// Given a mapping using column names and the header row of a CSV file,
    /// convert it into a `FieldMapping<usize>` containing column indices.
    pub fn convert_to_indices_using_headers(
        &self,
        headers: &StringRecord,
    ) -> Result<FieldMapping<usize>> {
        let mut header_columns = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            if let Some(_existing) = header_columns.insert(header, idx) {
                return Err(format_err!("duplicate header column `{}`", header));
            }
        }
        self.convert_to_indices(&header_columns)
    }

    fn convert_to_indices(
        &self,
        header_columns: &HashMap<&str, usize>,
    ) -> Result<FieldMapping<usize>> {
        let lookup = |column: &Option<String>| -> Result<Option<usize>> {
            column
                .as_ref()
                .map(|name| {
                    header_columns.get(&name[..]).copied().ok_or_else(|| {
                        format_err!("could not find column `{}` in header", name)
                    })
                })
                .transpose()
        };
        Ok(FieldMapping {
            name: lookup(&self.name)?,
            street: lookup(&self.street)?,
            postal_code: lookup(&self.postal_code)?,
            city: lookup(&self.city)?,
            governorate: lookup(&self.governorate)?,
            country: lookup(&self.country)?,
            complement: lookup(&self.complement)?,
            full_address: lookup(&self.full_address)?,
        })
    }

    /// Which header columns conflict with the geocoding columns we plan to
    /// append? Returns name and index of each, in header order.
    pub fn duplicate_columns<'header>(
        &self,
        output_columns: &[&str],
        header: &'header StringRecord,
    ) -> Vec<(&'header str, usize)> {
        let output_names: HashSet<&str> = output_columns.iter().copied().collect();
        header
            .iter()
            .enumerate()
            .filter(|(_, col)| output_names.contains(col))
            .map(|(i, col)| (col, i))
            .collect()
    }
}

impl FieldMapping<usize> {
    /// Given a CSV row, extract the `AddressRecord` to geocode.
    pub fn extract_record(&self, record: &StringRecord) -> AddressRecord {
        let field = |column: Option<usize>| -> Option<String> {
            column.and_then(|idx| record.get(idx)).and_then(non_blank)
        };
        AddressRecord {
            name: field(self.name),
            street: field(self.street),
            postal_code: field(self.postal_code),
            city: field(self.city),
            governorate: field(self.governorate),
            country: field(self.country),
            complement: field(self.complement),
            full_address: field(self.full_address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    fn mapping_json() -> FieldMapping<String> {
        serde_json::from_str(
            r#"{
                "name": "store_name",
                "street": "street_addr",
                "postal_code": "zip",
                "city": "town",
                "governorate": "gov",
                "country": "country"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn convert_mapping_to_indices() {
        let headers = StringRecord::from_iter(&[
            "id",
            "store_name",
            "street_addr",
            "zip",
            "town",
            "gov",
            "country",
        ]);
        let mapping = mapping_json().convert_to_indices_using_headers(&headers).unwrap();
        assert_eq!(mapping.name, Some(1));
        assert_eq!(mapping.street, Some(2));
        assert_eq!(mapping.postal_code, Some(3));
        assert_eq!(mapping.city, Some(4));
        assert_eq!(mapping.governorate, Some(5));
        assert_eq!(mapping.country, Some(6));
        assert_eq!(mapping.full_address, None);
    }

    #[test]
    fn missing_column_is_an_error() {
        let headers = StringRecord::from_iter(&["id", "store_name"]);
        let err = mapping_json()
            .convert_to_indices_using_headers(&headers)
            .unwrap_err();
        assert!(err.to_string().contains("street_addr"));
    }

    #[test]
    fn extract_trims_and_blanks_become_absent() {
        let headers = StringRecord::from_iter(&[
            "id",
            "store_name",
            "street_addr",
            "zip",
            "town",
            "gov",
            "country",
        ]);
        let mapping = mapping_json().convert_to_indices_using_headers(&headers).unwrap();
        let row = StringRecord::from_iter(&[
            "42",
            "  Pharmacie Centrale ",
            "12 Avenue Habib Bourguiba",
            "1000",
            "Tunis",
            "   ",
            "Tunisie",
        ]);
        let record = mapping.extract_record(&row);
        assert_eq!(record.name.as_deref(), Some("Pharmacie Centrale"));
        assert_eq!(record.street.as_deref(), Some("12 Avenue Habib Bourguiba"));
        assert_eq!(record.governorate, None);
    }

    #[test]
    fn synthesized_full_address_joins_mapped_fields_in_order() {
        let record = AddressRecord {
            name: Some("Pharmacie Centrale".to_owned()),
            street: Some("12 Avenue Habib Bourguiba".to_owned()),
            postal_code: Some("1000".to_owned()),
            city: Some("Tunis".to_owned()),
            country: Some("Tunisie".to_owned()),
            ..AddressRecord::default()
        };
        assert_eq!(
            record.full_address_or_synthesized().unwrap(),
            "Pharmacie Centrale, 12 Avenue Habib Bourguiba, 1000, Tunis, Tunisie",
        );
    }

    #[test]
    fn mapped_full_address_wins_over_synthesis() {
        let record = AddressRecord {
            street: Some("12 Avenue Habib Bourguiba".to_owned()),
            full_address: Some("whole address".to_owned()),
            ..AddressRecord::default()
        };
        assert_eq!(record.full_address_or_synthesized().unwrap(), "whole address");
    }

    #[test]
    fn empty_mapping_is_rejected() {
        let mapping: FieldMapping<String> = serde_json::from_str("{}").unwrap();
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn duplicate_columns_are_detected() {
        let headers = StringRecord::from_iter(&["id", "status", "street", "latitude"]);
        let mapping = mapping_json();
        let duplicates =
            mapping.duplicate_columns(&["status", "latitude", "longitude"], &headers);
        assert_eq!(duplicates, vec![("status", 1), ("latitude", 3)]);
    }
}
