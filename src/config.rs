//! Process configuration, read once at startup.

use anyhow::format_err;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Country the reference deployment biases toward. Used by the rewriter
/// (country suffix) and the adapters (region parameters), never by the
/// engine itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CountryBias {
    /// Human-readable country name appended to full addresses.
    pub name: String,
    /// ISO 3166-1 alpha-2 code (Google `region` / `components`).
    pub iso2: String,
    /// ISO 3166-1 alpha-3 code (HERE `in=countryCode:`).
    pub iso3: String,
}

impl Default for CountryBias {
    fn default() -> Self {
        CountryBias {
            name: "Tunisie".to_owned(),
            iso2: "TN".to_owned(),
            iso3: "TUN".to_owned(),
        }
    }
}

impl FromStr for CountryBias {
    type Err = Error;

    /// Parse `"name,ISO2,ISO3"`, e.g. `"Tunisie,TN,TUN"`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
        match parts.as_slice() {
            [name, iso2, iso3]
                if !name.is_empty() && iso2.len() == 2 && iso3.len() == 3 =>
            {
                Ok(CountryBias {
                    name: (*name).to_owned(),
                    iso2: iso2.to_uppercase(),
                    iso3: iso3.to_uppercase(),
                })
            }
            _ => Err(format_err!(
                "expected \"name,ISO2,ISO3\" (e.g. \"Tunisie,TN,TUN\"), found {:?}",
                s
            )),
        }
    }
}

/// Everything the orchestrator needs to know about its environment.
///
/// Credentials come from the environment; the rest has CLI-overridable
/// defaults. A provider whose credential is missing stays constructed but
/// is treated as permanently failed.
#[derive(Clone, Debug)]
pub struct Config {
    pub google_api_key: Option<String>,
    pub here_api_key: Option<String>,
    /// Contact email required by the Nominatim usage policy.
    pub osm_email: Option<String>,
    pub worker_count: usize,
    pub batch_size: usize,
    pub request_timeout: Duration,
    /// Minimum spacing between Nominatim requests (publisher policy: 1 s).
    pub osm_interval: Duration,
    pub country_bias: CountryBias,
    pub user_agent: String,
}

/// Default bounded parallelism for one job.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default per-request HTTP timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default Nominatim inter-request spacing.
pub const DEFAULT_OSM_INTERVAL_MS: u64 = 1000;

impl Config {
    /// Read credentials from the environment and apply defaults everywhere
    /// else.
    pub fn from_env() -> Config {
        Config {
            google_api_key: non_empty_env("GOOGLE_API_KEY"),
            here_api_key: non_empty_env("HERE_API_KEY"),
            osm_email: non_empty_env("OSM_EMAIL"),
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            osm_interval: Duration::from_millis(DEFAULT_OSM_INTERVAL_MS),
            country_bias: CountryBias::default(),
            user_agent: format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_bias_parses_and_normalizes_case() {
        let bias: CountryBias = "France,fr,fra".parse().unwrap();
        assert_eq!(bias.name, "France");
        assert_eq!(bias.iso2, "FR");
        assert_eq!(bias.iso3, "FRA");
    }

    #[test]
    fn country_bias_rejects_bad_shapes() {
        assert!("".parse::<CountryBias>().is_err());
        assert!("France".parse::<CountryBias>().is_err());
        assert!("France,FRA,FR".parse::<CountryBias>().is_err());
    }
}
