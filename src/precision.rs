//! Precision ranking shared by all providers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strum_macros::{Display, EnumString};

use crate::providers::ProviderId;
use crate::results::{GeocodeResult, GeocodeStatus};

/// How precise a geocoding hit is, normalized across providers.
///
/// Variants are declared worst-to-best so the derived `Ord` ranks
/// `Rooftop` highest, and `Option<Precision>` ranks `None` below
/// everything.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    EnumString,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Precision {
    Unknown,
    Approximate,
    GeometricCenter,
    RangeInterpolated,
    Rooftop,
}

impl Precision {
    /// True if this level is good enough to stop searching.
    pub fn is_final(self) -> bool {
        self == Precision::Rooftop
    }
}

/// Ranks results from any two providers.
///
/// A result only beats another if it is `OK`; among `OK` results higher
/// precision wins, and equal precision falls back to provider preference
/// order (earlier is better).
#[derive(Clone, Debug)]
pub struct ResultComparator {
    preference: Vec<ProviderId>,
}

impl ResultComparator {
    pub fn new(preference: Vec<ProviderId>) -> ResultComparator {
        ResultComparator { preference }
    }

    /// Position of `provider` in the preference order. Unlisted providers
    /// rank last.
    fn preference_rank(&self, provider: Option<ProviderId>) -> usize {
        provider
            .and_then(|p| self.preference.iter().position(|&pref| pref == p))
            .unwrap_or(self.preference.len())
    }

    /// Compare two results. `Ordering::Greater` means `a` should be kept
    /// over `b`.
    pub fn compare(&self, a: &GeocodeResult, b: &GeocodeResult) -> Ordering {
        let a_ok = a.status == GeocodeStatus::Ok;
        let b_ok = b.status == GeocodeStatus::Ok;
        match (a_ok, b_ok) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => Ordering::Equal,
            (true, true) => a
                .precision_level
                .cmp(&b.precision_level)
                // Lower rank = more preferred, so flip the comparison.
                .then_with(|| {
                    self.preference_rank(b.api_used).cmp(&self.preference_rank(a.api_used))
                }),
        }
    }

    /// True if `candidate` is strictly better than `best`.
    pub fn is_better(&self, candidate: &GeocodeResult, best: Option<&GeocodeResult>) -> bool {
        match best {
            None => candidate.status == GeocodeStatus::Ok,
            Some(best) => self.compare(candidate, best) == Ordering::Greater,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::GeocodeResult;

    fn result_with(
        status: GeocodeStatus,
        precision: Option<Precision>,
        provider: Option<ProviderId>,
    ) -> GeocodeResult {
        let mut result = GeocodeResult::empty(0);
        result.status = status;
        result.precision_level = precision;
        result.api_used = provider;
        result
    }

    fn default_comparator() -> ResultComparator {
        ResultComparator::new(vec![ProviderId::Here, ProviderId::Google, ProviderId::Osm])
    }

    #[test]
    fn rooftop_outranks_everything() {
        assert!(Precision::Rooftop > Precision::RangeInterpolated);
        assert!(Precision::RangeInterpolated > Precision::GeometricCenter);
        assert!(Precision::GeometricCenter > Precision::Approximate);
        assert!(Precision::Approximate > Precision::Unknown);
        assert!(Some(Precision::Unknown) > None);
    }

    #[test]
    fn ok_beats_any_failure() {
        let comparator = default_comparator();
        let ok = result_with(
            GeocodeStatus::Ok,
            Some(Precision::Approximate),
            Some(ProviderId::Osm),
        );
        let failed = result_with(GeocodeStatus::ZeroResults, None, Some(ProviderId::Here));
        assert!(comparator.is_better(&ok, Some(&failed)));
        assert!(!comparator.is_better(&failed, Some(&ok)));
    }

    #[test]
    fn higher_precision_wins_across_providers() {
        let comparator = default_comparator();
        let osm = result_with(
            GeocodeStatus::Ok,
            Some(Precision::GeometricCenter),
            Some(ProviderId::Osm),
        );
        let here = result_with(
            GeocodeStatus::Ok,
            Some(Precision::Approximate),
            Some(ProviderId::Here),
        );
        assert!(comparator.is_better(&osm, Some(&here)));
    }

    #[test]
    fn equal_precision_falls_back_to_preference() {
        let comparator = default_comparator();
        let here = result_with(
            GeocodeStatus::Ok,
            Some(Precision::Approximate),
            Some(ProviderId::Here),
        );
        let google = result_with(
            GeocodeStatus::Ok,
            Some(Precision::Approximate),
            Some(ProviderId::Google),
        );
        // HERE is preferred, so Google must not displace it.
        assert!(!comparator.is_better(&google, Some(&here)));
        assert!(comparator.is_better(&here, Some(&google)));
    }

    #[test]
    fn failures_never_become_best() {
        let comparator = default_comparator();
        let failed = result_with(GeocodeStatus::Error, None, Some(ProviderId::Here));
        assert!(!comparator.is_better(&failed, None));
    }

    #[test]
    fn precision_round_trips_through_strings() {
        use std::str::FromStr;
        for (level, text) in &[
            (Precision::Rooftop, "ROOFTOP"),
            (Precision::RangeInterpolated, "RANGE_INTERPOLATED"),
            (Precision::GeometricCenter, "GEOMETRIC_CENTER"),
            (Precision::Approximate, "APPROXIMATE"),
            (Precision::Unknown, "UNKNOWN"),
        ] {
            assert_eq!(level.to_string(), *text);
            assert_eq!(Precision::from_str(text).unwrap(), *level);
        }
    }
}
