//! CSV pipeline: read rows from standard input, geocode them, write the
//! enriched rows to standard output.

use anyhow::format_err;
use chrono::Utc;
use csv::StringRecord;
use metrics::{counter, describe_counter};
use std::collections::HashMap;
use std::io;
use std::iter::FromIterator;
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::EnumString;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::engine::{Orchestrator, PriorAttempt};
use crate::job::{finalize_job, open_job, JobRecord};
use crate::precision::Precision;
use crate::providers::ProviderId;
use crate::results::{GeocodeResult, GeocodeStatus, IMPROVED_COLUMN, OUTPUT_COLUMNS};
use crate::rows::FieldMapping;
use crate::scheduler::{run_job, JobOptions, ProgressSink, RowTask};
use crate::Result;

/// What should we do if a geocoding output column has the same name as a
/// column in the input?
#[derive(Debug, Clone, Copy, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum OnDuplicateColumns {
    /// Fail with an error.
    Error,
    /// Replace existing columns with the same name.
    Replace,
    /// Leave the old columns in place and append the new ones.
    Append,
}

/// Which previously geocoded rows a retry run should attempt again.
#[derive(Clone, Debug)]
pub struct RetryFilter {
    /// Rows whose prior `status` is one of these are retried.
    pub statuses: Vec<GeocodeStatus>,
    /// Rows whose prior `precision_level` is one of these are retried.
    pub precisions: Vec<Precision>,
}

impl Default for RetryFilter {
    fn default() -> Self {
        RetryFilter {
            statuses: vec![
                GeocodeStatus::Error,
                GeocodeStatus::ZeroResults,
                GeocodeStatus::OverQueryLimit,
            ],
            precisions: vec![Precision::Approximate, Precision::GeometricCenter],
        }
    }
}

impl RetryFilter {
    fn selects(&self, prior: &PriorAttempt) -> bool {
        if self.statuses.contains(&prior.status) {
            return true;
        }
        match prior.precision {
            Some(precision) => self.precisions.contains(&precision),
            None => false,
        }
    }
}

/// Everything the pipeline needs beyond the orchestrator itself.
pub struct PipelineOptions {
    pub mapping: FieldMapping<String>,
    pub job: JobOptions,
    pub on_duplicate_columns: OnDuplicateColumns,
    /// `Some` turns this run into a retry over previously enriched output.
    pub retry: Option<RetryFilter>,
}

/// A parsed input, ready to geocode: reduced rows for output, the tasks to
/// run, and the prior result values to echo for untouched rows.
#[derive(Debug)]
struct PreparedInput {
    out_headers: StringRecord,
    /// Input rows with any replaced columns already removed.
    rows: Vec<StringRecord>,
    tasks: Vec<RowTask>,
    /// Per row: prior values for each output column, captured before any
    /// column removal. Empty map when the input had none.
    prior_values: Vec<HashMap<&'static str, String>>,
}

/// The geocoding columns this run appends.
fn output_columns(retry: bool) -> Vec<&'static str> {
    let mut columns = OUTPUT_COLUMNS.to_vec();
    if retry {
        columns.push(IMPROVED_COLUMN);
    }
    columns
}

/// Remove columns from `row` if they're set to true in `remove_column_flags`.
fn remove_columns(row: &StringRecord, remove_column_flags: &[bool]) -> StringRecord {
    debug_assert_eq!(row.len(), remove_column_flags.len());
    StringRecord::from_iter(row.iter().zip(remove_column_flags).filter_map(
        |(value, &remove)| {
            if remove {
                None
            } else {
                Some(value.to_owned())
            }
        },
    ))
}

/// Parse a prior attempt out of the captured result columns. Rows that
/// never carried a parseable status read as prior failures.
fn parse_prior(values: &HashMap<&'static str, String>) -> PriorAttempt {
    let status = values
        .get("status")
        .and_then(|s| GeocodeStatus::from_str(s).ok())
        .unwrap_or(GeocodeStatus::Error);
    let precision = values
        .get("precision_level")
        .and_then(|s| Precision::from_str(s).ok());
    let api_used = values
        .get("api_used")
        .and_then(|s| ProviderId::from_str(s).ok());
    PriorAttempt {
        api_used,
        status,
        precision,
    }
}

fn prepare_input(
    in_headers: &StringRecord,
    records: Vec<StringRecord>,
    options: &PipelineOptions,
) -> Result<PreparedInput> {
    let appended = output_columns(options.retry.is_some());

    // Prior result values have to be captured before any columns are
    // removed, so locate them in the original header.
    let prior_indices: Vec<(&'static str, usize)> = appended
        .iter()
        .filter_map(|name| {
            in_headers
                .iter()
                .position(|header| header == *name)
                .map(|idx| (*name, idx))
        })
        .collect();
    if options.retry.is_some() && !prior_indices.iter().any(|(name, _)| *name == "status") {
        return Err(format_err!(
            "retry input must carry a `status` column from a previous run"
        ));
    }

    // Figure out if we have any duplicate columns, and what to do about it.
    let duplicate_columns = options.mapping.duplicate_columns(&appended, in_headers);
    let mut should_remove_columns = false;
    let mut remove_column_flags = vec![false; in_headers.len()];
    if !duplicate_columns.is_empty() {
        let names = duplicate_columns
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ");
        match options.on_duplicate_columns {
            OnDuplicateColumns::Error => {
                return Err(format_err!(
                    "input columns would conflict with geocoding columns: {}",
                    names,
                ));
            }
            OnDuplicateColumns::Replace => {
                debug!("replacing input columns: {}", names);
                should_remove_columns = true;
                for (_, i) in &duplicate_columns {
                    remove_column_flags[*i] = true;
                }
            }
            OnDuplicateColumns::Append => {
                debug!("output contains duplicate columns: {}", names);
            }
        }
    }

    let reduced_headers = if should_remove_columns {
        remove_columns(in_headers, &remove_column_flags)
    } else {
        in_headers.to_owned()
    };

    // Convert our mapping from column names to indices. This needs to
    // happen _after_ `remove_columns` on our headers.
    let mapping = options
        .mapping
        .convert_to_indices_using_headers(&reduced_headers)?;

    let mut out_headers = reduced_headers;
    out_headers.extend(appended.iter());

    let mut rows = Vec::with_capacity(records.len());
    let mut tasks = Vec::with_capacity(records.len());
    let mut prior_values = Vec::with_capacity(records.len());
    for (row_index, record) in records.into_iter().enumerate() {
        let captured: HashMap<&'static str, String> = prior_indices
            .iter()
            .filter_map(|(name, idx)| {
                record.get(*idx).map(|value| (*name, value.to_owned()))
            })
            .collect();

        let reduced = if should_remove_columns {
            remove_columns(&record, &remove_column_flags)
        } else {
            record
        };
        let address = mapping.extract_record(&reduced);

        match &options.retry {
            None => tasks.push(RowTask {
                row_index,
                record: address,
                prior: None,
            }),
            Some(filter) => {
                let prior = parse_prior(&captured);
                if filter.selects(&prior) {
                    tasks.push(RowTask {
                        row_index,
                        record: address,
                        prior: Some(prior),
                    });
                }
            }
        }

        rows.push(reduced);
        prior_values.push(captured);
    }

    Ok(PreparedInput {
        out_headers,
        rows,
        tasks,
        prior_values,
    })
}

/// Append this row's result columns: the fresh result when the row was
/// geocoded, otherwise whatever the input already carried.
fn append_result_columns(
    out_row: &mut StringRecord,
    appended: &[&'static str],
    result: Option<&GeocodeResult>,
    prior: &HashMap<&'static str, String>,
) {
    match result {
        Some(result) => {
            out_row.extend(result.column_values().iter().map(|v| v.to_owned()));
            if appended.last() == Some(&IMPROVED_COLUMN) {
                out_row.push_field(&result.improved_value());
            }
        }
        None => {
            for column in appended {
                out_row.push_field(prior.get(column).map(|v| v.as_str()).unwrap_or(""));
            }
        }
    }
}

/// Read CSV rows from standard input, geocode them, and write the
/// enriched CSV to standard output. Returns the sealed job record.
pub async fn geocode_stdio(
    options: PipelineOptions,
    orchestrator: Arc<Orchestrator>,
    progress: Option<ProgressSink>,
    cancel: &CancelToken,
) -> Result<JobRecord> {
    describe_counter!("geofuse.jobs.total", "Geocoding jobs run");

    // Read the whole input up front: the scheduler reassembles output by
    // row index, so the job is bounded by its input either way. The stdin
    // lock must not be held across an await point.
    let (in_headers, records) = {
        let stdin = io::stdin();
        let mut rdr = csv::Reader::from_reader(stdin.lock());
        let in_headers = rdr.headers()?.to_owned();
        let mut records = vec![];
        for record in rdr.records() {
            records.push(record?);
        }
        (in_headers, records)
    };
    debug!("input headers: {:?}", in_headers);

    let appended = output_columns(options.retry.is_some());
    let prepared = prepare_input(&in_headers, records, &options)?;
    debug!("output headers: {:?}", prepared.out_headers);

    let job_id = format!("JOB_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let record = open_job(&job_id, prepared.tasks.len());
    info!(
        "job {}: {} rows to geocode out of {} input rows",
        job_id,
        prepared.tasks.len(),
        prepared.rows.len()
    );

    let output =
        run_job(orchestrator, prepared.tasks, options.job, progress, cancel).await;
    counter!("geofuse.jobs.total", 1);

    // Index results by row for the merge below.
    let mut results_by_row: HashMap<usize, &GeocodeResult> = HashMap::new();
    for result in &output.results {
        results_by_row.insert(result.row_index, result);
    }

    let stdout = io::stdout();
    let mut wtr = csv::Writer::from_writer(stdout.lock());
    wtr.write_record(&prepared.out_headers)?;
    for (row_index, row) in prepared.rows.iter().enumerate() {
        let mut out_row = row.to_owned();
        append_result_columns(
            &mut out_row,
            &appended,
            results_by_row.get(&row_index).copied(),
            &prepared.prior_values[row_index],
        );
        wtr.write_record(&out_row)?;
    }
    wtr.flush()?;

    let sealed = finalize_job(record, &output.results, output.cancelled);
    info!(
        "job {} sealed: {}",
        sealed.job_id,
        serde_json::to_string(&sealed).unwrap_or_else(|_| "<unserializable>".to_owned())
    );
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunMode;

    fn mapping() -> FieldMapping<String> {
        serde_json::from_str(r#"{ "full_address": "address" }"#).unwrap()
    }

    fn job_options() -> JobOptions {
        JobOptions {
            batch_size: 10,
            worker_count: 2,
            mode: RunMode::Multi,
        }
    }

    fn fresh_options(on_duplicate_columns: OnDuplicateColumns) -> PipelineOptions {
        PipelineOptions {
            mapping: mapping(),
            job: job_options(),
            on_duplicate_columns,
            retry: None,
        }
    }

    fn retry_options() -> PipelineOptions {
        PipelineOptions {
            mapping: mapping(),
            job: job_options(),
            on_duplicate_columns: OnDuplicateColumns::Replace,
            retry: Some(RetryFilter::default()),
        }
    }

    fn headers(columns: &[&str]) -> StringRecord {
        StringRecord::from_iter(columns.iter())
    }

    #[test]
    fn fresh_input_yields_one_task_per_row() {
        let in_headers = headers(&["id", "address"]);
        let records = vec![
            StringRecord::from_iter(&["1", "12 Avenue Habib Bourguiba, Tunis"]),
            StringRecord::from_iter(&["2", "7 Rue de Rome, Tunis"]),
        ];
        let prepared =
            prepare_input(&in_headers, records, &fresh_options(OnDuplicateColumns::Error))
                .unwrap();
        assert_eq!(prepared.tasks.len(), 2);
        assert_eq!(prepared.tasks[0].row_index, 0);
        assert_eq!(prepared.tasks[1].row_index, 1);
        assert_eq!(
            prepared.tasks[0].record.full_address.as_deref(),
            Some("12 Avenue Habib Bourguiba, Tunis"),
        );
        assert!(prepared.tasks[0].prior.is_none());
        let out: Vec<&str> = prepared.out_headers.iter().collect();
        assert_eq!(out[0], "id");
        assert_eq!(out[1], "address");
        assert!(out.contains(&"status"));
        assert!(out.contains(&"timestamp"));
        assert!(!out.contains(&"improved"));
    }

    #[test]
    fn duplicate_columns_error_by_default() {
        let in_headers = headers(&["address", "status"]);
        let records = vec![StringRecord::from_iter(&["x", "OK"])];
        let err =
            prepare_input(&in_headers, records, &fresh_options(OnDuplicateColumns::Error))
                .unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn duplicate_columns_can_be_replaced() {
        let in_headers = headers(&["address", "status"]);
        let records = vec![StringRecord::from_iter(&["somewhere", "OK"])];
        let prepared = prepare_input(
            &in_headers,
            records,
            &fresh_options(OnDuplicateColumns::Replace),
        )
        .unwrap();
        // The old status column is gone; the new one comes from us.
        let out: Vec<&str> = prepared.out_headers.iter().collect();
        assert_eq!(out.iter().filter(|c| **c == "status").count(), 1);
        assert_eq!(prepared.rows[0].len(), 1);
    }

    #[test]
    fn retry_requires_a_status_column() {
        let in_headers = headers(&["id", "address"]);
        let records = vec![StringRecord::from_iter(&["1", "x"])];
        let err = prepare_input(&in_headers, records, &retry_options()).unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn retry_selects_failures_and_weak_precisions_only() {
        let in_headers = headers(&["address", "status", "precision_level", "api_used"]);
        let records = vec![
            StringRecord::from_iter(&["a", "OK", "ROOFTOP", "here"]),
            StringRecord::from_iter(&["b", "ERROR", "", ""]),
            StringRecord::from_iter(&["c", "OK", "APPROXIMATE", "google"]),
            StringRecord::from_iter(&["d", "ZERO_RESULTS", "", "osm"]),
            StringRecord::from_iter(&["e", "OK", "RANGE_INTERPOLATED", "here"]),
        ];
        let prepared = prepare_input(&in_headers, records, &retry_options()).unwrap();

        let retried: Vec<usize> = prepared.tasks.iter().map(|t| t.row_index).collect();
        assert_eq!(retried, vec![1, 2, 3]);

        // Prior attempt metadata rides along for retry ordering.
        let prior = prepared.tasks[1].prior.as_ref().unwrap();
        assert_eq!(prior.status, GeocodeStatus::Ok);
        assert_eq!(prior.precision, Some(Precision::Approximate));
        assert_eq!(prior.api_used, Some(ProviderId::Google));

        // Untouched rows keep their old values for the echo pass.
        assert_eq!(prepared.prior_values[0]["status"], "OK");
        assert_eq!(prepared.prior_values[0]["precision_level"], "ROOFTOP");
    }

    #[test]
    fn untouched_retry_rows_echo_their_prior_values() {
        let appended = output_columns(true);
        let mut prior = HashMap::new();
        prior.insert("status", "OK".to_owned());
        prior.insert("precision_level", "ROOFTOP".to_owned());
        prior.insert("api_used", "here".to_owned());

        let mut out_row = StringRecord::from_iter(&["a"]);
        append_result_columns(&mut out_row, &appended, None, &prior);

        let values: Vec<&str> = out_row.iter().collect();
        // "a" + the appended columns.
        assert_eq!(values.len(), 1 + appended.len());
        assert_eq!(values[1], "OK");
        assert_eq!(values[5], "ROOFTOP");
        // No fresh attempt, so `improved` stays blank.
        assert_eq!(values[values.len() - 1], "");
    }

    #[test]
    fn geocoded_rows_append_fresh_values() {
        let appended = output_columns(true);
        let mut result = GeocodeResult::empty(0);
        result.status = GeocodeStatus::Ok;
        result.latitude = Some(36.8);
        result.longitude = Some(10.18);
        result.precision_level = Some(Precision::Rooftop);
        result.api_used = Some(ProviderId::Osm);
        result.improved = Some(true);

        let mut out_row = StringRecord::from_iter(&["a"]);
        append_result_columns(&mut out_row, &appended, Some(&result), &HashMap::new());
        let values: Vec<&str> = out_row.iter().collect();
        assert_eq!(values[1], "OK");
        assert_eq!(values[2], "36.8");
        assert_eq!(values[values.len() - 1], "true");
    }
}
