use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use futures::StreamExt;
use parkgrid::{
    config::Config,
    error::JobError,
    job::{JobId, JobRequest, Orchestrator},
    manager::JobManager,
};
use serde::Deserialize;
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file; defaults are used if it does not exist
    #[arg(long, default_value = "parkgrid.toml")]
    config: PathBuf,

    /// Host and port to bind (e.g. 0.0.0.0:3033)
    #[arg(long, default_value = "0.0.0.0:3033")]
    bind: std::net::SocketAddr,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

type AppState = Arc<JobManager>;

struct ApiError(JobError);

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::EventsTaken(_) => StatusCode::CONFLICT,
            JobError::Configuration(_) => StatusCode::BAD_REQUEST,
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_file_or_default(&args.config)?;

    let manager = Arc::new(JobManager::new(Orchestrator::from_config(config)?));

    let app = Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(start_job))
        .route("/jobs/{id}", get(job_status).delete(cancel_job))
        .route("/jobs/{id}/events", get(job_events))
        .with_state(manager);

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;

    info!("Listening on {}", args.bind);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn list_jobs(State(manager): State<AppState>) -> impl IntoResponse {
    Json(manager.list())
}

async fn start_job(State(manager): State<AppState>, Json(request): Json<JobRequest>) -> impl IntoResponse {
    let id = manager.start_job(request);

    (StatusCode::CREATED, Json(json!({ "id": id })))
}

async fn job_status(State(manager): State<AppState>, Path(id): Path<JobId>) -> Result<Response, ApiError> {
    Ok(Json(manager.status(id)?).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct CancelParams {
    /// Also drop the job's record
    #[serde(default)]
    forget: bool,
}

async fn cancel_job(
    State(manager): State<AppState>,
    Path(id): Path<JobId>,
    Query(params): Query<CancelParams>,
) -> Result<Response, ApiError> {
    let ack = manager.cancel_job(id)?;

    if params.forget {
        manager.forget(id)?;
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "ack": ack }))).into_response())
}

/// Newline-delimited JSON events until the job ends. The job is dropped once
/// its terminal event was sent.
async fn job_events(State(manager): State<AppState>, Path(id): Path<JobId>) -> Result<Response, ApiError> {
    let stream = manager.stream_events(id)?.map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');

            line
        })
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}
