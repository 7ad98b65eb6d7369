//! Job records: pure bookkeeping around one scheduler run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use strum_macros::Display;

use crate::precision::Precision;
use crate::providers::ProviderId;
use crate::results::GeocodeResult;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Success,
    Failed,
}

/// The sealed record of one job. Opened at scheduler entry, finalized at
/// scheduler exit, append-only afterwards.
#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub total_rows: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Successful rows per precision level; sums to `success_count`.
    pub precision_histogram: BTreeMap<Precision, usize>,
    /// Rows answered per provider.
    pub api_histogram: BTreeMap<ProviderId, usize>,
    pub details: Option<String>,
}

/// Open a job record for `total_rows` rows.
pub fn open_job(job_id: impl Into<String>, total_rows: usize) -> JobRecord {
    JobRecord {
        job_id: job_id.into(),
        started_at: Utc::now(),
        ended_at: None,
        status: JobStatus::InProgress,
        total_rows,
        success_count: 0,
        failed_count: 0,
        precision_histogram: BTreeMap::new(),
        api_histogram: BTreeMap::new(),
        details: None,
    }
}

/// Compute final counts and histograms and seal the record.
pub fn finalize_job(
    mut record: JobRecord,
    results: &[GeocodeResult],
    cancelled: bool,
) -> JobRecord {
    record.ended_at = Some(Utc::now());
    record.status = if cancelled {
        JobStatus::Failed
    } else {
        JobStatus::Success
    };

    record.success_count = 0;
    record.precision_histogram.clear();
    record.api_histogram.clear();
    for result in results {
        if result.is_ok() {
            record.success_count += 1;
            if let Some(precision) = result.precision_level {
                *record.precision_histogram.entry(precision).or_insert(0) += 1;
            }
            if let Some(provider) = result.api_used {
                *record.api_histogram.entry(provider).or_insert(0) += 1;
            }
        }
    }
    record.failed_count = record.total_rows - record.success_count;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::GeocodeStatus;
    use crate::variants::VariantKind;

    fn ok_result(row_index: usize, precision: Precision, provider: ProviderId) -> GeocodeResult {
        let mut result = GeocodeResult::empty(row_index);
        result.status = GeocodeStatus::Ok;
        result.latitude = Some(36.8);
        result.longitude = Some(10.18);
        result.precision_level = Some(precision);
        result.api_used = Some(provider);
        result.variant_kind = Some(VariantKind::Reformatted);
        result
    }

    #[test]
    fn counts_add_up() {
        let record = open_job("JOB_1", 5);
        let results = vec![
            ok_result(0, Precision::Rooftop, ProviderId::Here),
            ok_result(1, Precision::Rooftop, ProviderId::Google),
            ok_result(2, Precision::Approximate, ProviderId::Here),
            GeocodeResult::empty(3),
            GeocodeResult::empty(4),
        ];
        let sealed = finalize_job(record, &results, false);

        assert_eq!(sealed.status, JobStatus::Success);
        assert_eq!(sealed.success_count, 3);
        assert_eq!(sealed.failed_count, 2);
        assert_eq!(sealed.success_count + sealed.failed_count, sealed.total_rows);
        assert_eq!(sealed.precision_histogram[&Precision::Rooftop], 2);
        assert_eq!(sealed.precision_histogram[&Precision::Approximate], 1);
        let precision_total: usize = sealed.precision_histogram.values().sum();
        assert_eq!(precision_total, sealed.success_count);
        assert_eq!(sealed.api_histogram[&ProviderId::Here], 2);
        assert_eq!(sealed.api_histogram[&ProviderId::Google], 1);
        assert!(sealed.ended_at.is_some());
    }

    #[test]
    fn cancelled_jobs_seal_as_failed() {
        let record = open_job("JOB_2", 1);
        let sealed = finalize_job(record, &[GeocodeResult::empty(0)], true);
        assert_eq!(sealed.status, JobStatus::Failed);
        assert_eq!(sealed.failed_count, 1);
    }

    #[test]
    fn record_serializes_with_string_keys() {
        let record = open_job("JOB_3", 1);
        let sealed = finalize_job(
            record,
            &[ok_result(0, Precision::Rooftop, ProviderId::Osm)],
            false,
        );
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["precision_histogram"]["ROOFTOP"], 1);
        assert_eq!(json["api_histogram"]["osm"], 1);
    }
}
