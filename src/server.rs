//! Code to support server mode.
//!
//! In server mode the process is one long-lived job: a single orchestrator
//! owns the cache and rate-limiter state, so the Nominatim request spacing
//! stays global across HTTP requests.

use std::sync::Arc;

use anyhow::{format_err, Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    headers::{HeaderMap, HeaderName},
    http::header::CONTENT_TYPE,
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::cancel::Cancellation;
use crate::engine::{Orchestrator, RunMode};
use crate::results::GeocodeResult;
use crate::rows::AddressRecord;
use crate::scheduler::{run_job, JobOptions, RowTask};

/// An error message to serialize as JSON on error.
#[derive(Serialize)]
struct ErrorResponse {
    /// A human-readable error.
    message: String,
}

struct State {
    orchestrator: Arc<Orchestrator>,
    options: JobOptions,
    /// Held for the lifetime of the server so worker tokens never read as
    /// cancelled.
    cancellation: Cancellation,
}

// Run the server. Should not return.
pub async fn run_server(
    listen_addr: &str,
    orchestrator: Arc<Orchestrator>,
    options: JobOptions,
) -> Result<()> {
    // Build our application with a single route.
    let state = Arc::new(State {
        orchestrator,
        options,
        cancellation: Cancellation::new(),
    });

    let app = Router::new()
        .route("/geocode", post(handle_post_geocode))
        .layer(Extension(state))
        // Assumes ~128 rows at ~128 bytes each. More than this should go
        // through the CLI pipeline, which batches properly.
        .layer(DefaultBodyLimit::max(16384));

    let listen_addr = listen_addr.parse().with_context(|| {
        format!("could not parse listen address: {:?}", listen_addr)
    })?;

    // Run it with axum on the given listen address.
    axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await
        .context("web server failed to start")
}

/// Our /geocode request format.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeocodeRequest {
    /// Rows to geocode. Always a list, because the underlying engine is
    /// built for batches and we want to encourage using it that way.
    rows: Vec<AddressRecord>,
    /// Optional run-mode override for this request.
    #[serde(default)]
    mode: Option<RunMode>,
}

/// Our geocode response format.
#[derive(Debug, Serialize)]
struct GeocodeResponse {
    /// One result per input row, in input order.
    results: Vec<GeocodeResult>,
}

/// POST /geocode
async fn handle_post_geocode(
    Extension(state): Extension<Arc<State>>,
    headers: HeaderMap,
    Json(body): Json<GeocodeRequest>,
) -> Result<(StatusCode, Json<GeocodeResponse>), (StatusCode, Json<ErrorResponse>)> {
    // Require users to specify this, so that we can later add other body
    // formats without breaking anything.
    if let Err(err) = expect_header_value(&headers, &CONTENT_TYPE, "application/json") {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                message: err.to_string(),
            }),
        ));
    }

    let tasks: Vec<RowTask> = body
        .rows
        .into_iter()
        .enumerate()
        .map(|(row_index, record)| RowTask {
            row_index,
            record,
            prior: None,
        })
        .collect();

    let mut options = state.options;
    if let Some(mode) = body.mode {
        options.mode = mode;
    }

    let output = run_job(
        state.orchestrator.clone(),
        tasks,
        options,
        None,
        &state.cancellation.token(),
    )
    .await;

    Ok((
        StatusCode::OK,
        Json(GeocodeResponse {
            results: output.results,
        }),
    ))
}

fn expect_header_value(
    headers: &HeaderMap,
    header_name: &HeaderName,
    expected: &str,
) -> Result<()> {
    match headers.get(CONTENT_TYPE) {
        Some(v) if v == expected => Ok(()),
        Some(v) => Err(format_err!(
            "expected {} {:?}, got {:?}",
            header_name,
            expected,
            v
        )),
        None => Err(format_err!("Missing header {}", header_name)),
    }
}
