#![recursion_limit = "128"]

pub use anyhow::Result;
use anyhow::{format_err, Context, Error};
use clap::{Parser, Subcommand};
use opinionated_metrics::Mode;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn};
use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

mod cache;
mod call_log;
mod cancel;
mod config;
mod engine;
mod job;
mod pipeline;
mod precision;
mod providers;
mod rate_limit;
mod results;
mod rows;
mod scheduler;
mod server;
mod variants;

use crate::call_log::{CallLog, JsonLinesLog, NullLog};
use crate::cancel::Cancellation;
use crate::config::{Config, CountryBias};
use crate::engine::{Orchestrator, RunMode};
use crate::pipeline::{geocode_stdio, OnDuplicateColumns, PipelineOptions, RetryFilter};
use crate::precision::Precision;
use crate::providers::{
    shared_http_client, GoogleProvider, HereProvider, OsmProvider, Provider,
};
use crate::results::GeocodeStatus;
use crate::rows::FieldMapping;
use crate::scheduler::JobOptions;
use crate::server::run_server;

#[cfg(all(feature = "jemallocator", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Key/value pairs used to annotate reported metrics. These are of the form
/// `KEY=VALUE`. (Helper struct for argument parsing.)
#[derive(Clone, Debug)]
struct MetricsLabel {
    key: String,
    value: String,
}

impl FromStr for MetricsLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((key, value)) = s.split_once('=') {
            Ok(MetricsLabel {
                key: key.to_owned(),
                value: value.to_owned(),
            })
        } else {
            Err(format_err!("expected \"key=value\", found {:?}", s))
        }
    }
}

/// A comma-separated list of result statuses. (Helper struct for argument
/// parsing.)
#[derive(Clone, Debug)]
struct StatusList(Vec<GeocodeStatus>);

impl FromStr for StatusList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let statuses = s
            .split(',')
            .map(|part| {
                GeocodeStatus::from_str(part.trim())
                    .map_err(|_| format_err!("unknown status {:?}", part))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(StatusList(statuses))
    }
}

/// A comma-separated list of precision levels. (Helper struct for argument
/// parsing.)
#[derive(Clone, Debug)]
struct PrecisionList(Vec<Precision>);

impl FromStr for PrecisionList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let precisions = s
            .split(',')
            .map(|part| {
                Precision::from_str(part.trim())
                    .map_err(|_| format_err!("unknown precision level {:?}", part))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PrecisionList(precisions))
    }
}

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "geocode CSV files passed on standard input, fusing HERE, Google, and OSM"
)]
struct Opt {
    /// A JSON file mapping the semantic address fields (name, street,
    /// postal_code, city, governorate, country, complement, full_address)
    /// to input column names.
    #[arg(long = "mapping")]
    mapping_path: Option<PathBuf>,

    /// Which providers to consult. [here_only, google_only, osm_only, multi]
    #[arg(long = "mode", default_value = "multi")]
    mode: RunMode,

    /// What should we do if geocoding output columns have the same names as
    /// input columns? [error, replace, append]
    #[arg(long = "duplicate-columns", default_value = "error")]
    on_duplicate_columns: OnDuplicateColumns,

    /// Rows per batch. Progress and statistics are reported per batch.
    #[arg(long = "batch-size", default_value_t = config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// How many rows to geocode in parallel.
    #[arg(long = "workers", default_value_t = config::DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Country bias as "name,ISO2,ISO3".
    #[arg(long = "country-bias", default_value = "Tunisie,TN,TUN")]
    country_bias: CountryBias,

    /// Per-request HTTP timeout, in seconds.
    #[arg(long = "timeout-secs", default_value_t = config::DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Minimum spacing between OSM Nominatim requests, in milliseconds.
    #[arg(long = "osm-interval-ms", default_value_t = config::DEFAULT_OSM_INTERVAL_MS)]
    osm_interval_ms: u64,

    /// Append a JSON-lines record of every provider call to this file.
    #[arg(long = "call-log", value_name = "PATH")]
    call_log_path: Option<PathBuf>,

    /// Treat the input as previously geocoded output and retry the rows
    /// selected by --retry-statuses / --retry-precisions.
    #[arg(long = "retry")]
    retry: bool,

    /// Prior statuses that make a row eligible for retry.
    #[arg(
        long = "retry-statuses",
        default_value = "ERROR,ZERO_RESULTS,OVER_QUERY_LIMIT",
        requires = "retry"
    )]
    retry_statuses: StatusList,

    /// Prior precision levels that make a row eligible for retry.
    #[arg(
        long = "retry-precisions",
        default_value = "APPROXIMATE,GEOMETRIC_CENTER",
        requires = "retry"
    )]
    retry_precisions: PrecisionList,

    /// Labels to attach to reported metrics. Recommended: "source=$SOURCE".
    #[arg(long = "metrics-label", value_name = "KEY=VALUE")]
    metrics_labels: Vec<MetricsLabel>,

    /// Command to run.
    #[command(subcommand)]
    cmd: Option<Command>,
}

/// Subcommands for geofuse.
#[derive(Debug, Subcommand)]
enum Command {
    /// Start in server mode.
    Server {
        /// Address that the server should listen on.
        #[arg(long = "listen-address", default_value = "127.0.0.1:8787")]
        listen_address: String,
    },
}

// Our main entrypoint. We rely on the fact that `anyhow::Error` has a `Debug`
// implementation that will print a nice friendly error if we return from `main`
// with an error.
#[tokio::main]
async fn main() -> Result<()> {
    // Configure tracing.
    let filter = EnvFilter::from_default_env();
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .init();
    let _span = info_span!("geofuse").entered();
    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // Parse our command-line arguments.
    let opt = Opt::parse();

    // Set up metrics recording.
    let mut metrics_builder = opinionated_metrics::Builder::new(Mode::Cli);
    for label in &opt.metrics_labels {
        metrics_builder = metrics_builder.add_global_label(&label.key, &label.value);
    }
    let metrics_handle = metrics_builder.install()?;

    // Read credentials from the environment and apply the CLI overrides.
    let mut config = Config::from_env();
    config.worker_count = opt.workers;
    config.batch_size = opt.batch_size;
    config.request_timeout = Duration::from_secs(opt.timeout_secs);
    config.osm_interval = Duration::from_millis(opt.osm_interval_ms);
    config.country_bias = opt.country_bias.clone();
    if config.here_api_key.is_none() {
        warn!("HERE_API_KEY is not set; HERE will be skipped");
    }
    if config.google_api_key.is_none() {
        warn!("GOOGLE_API_KEY is not set; Google will be skipped");
    }
    if config.osm_email.is_none() {
        warn!("OSM_EMAIL is not set; OSM Nominatim will be skipped");
    }

    // Where provider call records go.
    let call_log: Arc<dyn CallLog> = match &opt.call_log_path {
        Some(path) => Arc::new(
            JsonLinesLog::open(path)
                .with_context(|| format!("cannot open call log {}", path.display()))?,
        ),
        None => Arc::new(NullLog),
    };

    // One shared HTTP client, one adapter per provider, one orchestrator.
    // The declaration order is the provider preference order.
    let http_client = shared_http_client(config.worker_count);
    let providers: Vec<Arc<dyn Provider>> = vec![
        Arc::new(HereProvider::new(&config, http_client.clone(), call_log.clone())),
        Arc::new(GoogleProvider::new(&config, http_client.clone(), call_log.clone())),
        Arc::new(OsmProvider::new(&config, http_client, call_log)),
    ];
    let orchestrator = Arc::new(Orchestrator::new(&config, providers));

    let job_options = JobOptions {
        batch_size: config.batch_size,
        worker_count: config.worker_count,
        mode: opt.mode,
    };

    // Cancel in-flight work on Ctrl-C; rate-limit waits and HTTP calls
    // abort promptly and skipped rows are reported as cancelled.
    let cancellation = Arc::new(Cancellation::new());
    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling the job");
                cancellation.cancel();
            }
        });
    }

    // Decide which command to run.
    let result = match opt.cmd {
        // Run in server mode.
        Some(Command::Server { listen_address }) => {
            run_server(&listen_address, orchestrator, job_options).await
        }
        // Run in CLI pipeline mode.
        None => {
            let mapping_path = opt.mapping_path.as_ref().ok_or_else(|| {
                format_err!("--mapping is required when geocoding standard input")
            })?;
            let mapping = FieldMapping::from_path(mapping_path)?;
            let retry = if opt.retry {
                Some(RetryFilter {
                    statuses: opt.retry_statuses.0.clone(),
                    precisions: opt.retry_precisions.0.clone(),
                })
            } else {
                None
            };
            let options = PipelineOptions {
                mapping,
                job: job_options,
                on_duplicate_columns: opt.on_duplicate_columns,
                retry,
            };
            geocode_stdio(options, orchestrator, None, &cancellation.token())
                .await
                .map(|_record| ())
        }
    };

    // Report our metrics.
    if let Err(err) = metrics_handle.report().await {
        warn!("could not report metrics: {:?}", err);
    }

    result
}
