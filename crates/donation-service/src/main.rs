use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use donation_api::pipeline::METHOD_NOT_ALLOWED_MESSAGE;
use donation_api::{ConfigArgs, DonationApi, IngestResponse, SearchResults};
use donation_core::StoreBackend;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ServiceState {
    api: Arc<DonationApi>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: StoreBackend,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "donation-service")]
#[command(about = "HTTP ingestion and search service for the donation ledger")]
struct Args {
    #[arg(long, env = "DONATION_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[command(flatten)]
    config: ConfigArgs,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, Json(self)).into_response()
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/donations", post(ingest_donation).fallback(method_not_allowed))
        .route("/v1/admin/donations", get(search_donations))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.config.load().context("failed to load donation config")?;
    let api = DonationApi::new(config);

    // Ingestion stays up without a store; the mirrors still take every record.
    if let Err(err) = api.migrate().await {
        tracing::warn!(backend = api.backend().as_str(), error = %err, "schema migration failed at startup");
    }

    let state = ServiceState { api: Arc::new(api) };
    let router = app(state).layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
        tracing::span!(
            Level::INFO,
            "http_request",
            method = %request.method(),
            path = %request.uri().path()
        )
    }));

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "starting donation service");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", backend: state.api.backend() })
}

async fn ingest_donation(State(state): State<ServiceState>, body: Bytes) -> Json<IngestResponse> {
    Json(state.api.ingest_body(&body).await)
}

async fn method_not_allowed() -> (StatusCode, Json<IngestResponse>) {
    (StatusCode::METHOD_NOT_ALLOWED, Json(IngestResponse::rejected(METHOD_NOT_ALLOWED_MESSAGE)))
}

async fn search_donations(
    State(state): State<ServiceState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResults>, ServiceError> {
    let filter = params.q.unwrap_or_default();
    let results = state
        .api
        .search(&filter, params.page.as_deref())
        .await
        .map_err(|err| ServiceError { error: err.to_string() })?;
    Ok(Json(results))
}
