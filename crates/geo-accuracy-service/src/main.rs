use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use geo_accuracy_api::{
    AccuracyApi, AccuracySettings, CheckInError, CheckInOutcome, CheckInRequest, MigrateResult,
    StaticCeilings, API_CONTRACT_VERSION,
};
use geo_accuracy_core::{AccuracyStat, ContextKey};
use geo_accuracy_store_sqlite::{SchemaStatus, SqliteStatStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

type SqliteApi = AccuracyApi<SqliteStatStore, StaticCeilings>;

#[derive(Clone)]
struct ServiceState {
    api: Arc<SqliteApi>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct StatShowRequest {
    context: ContextKey,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "geo-accuracy-service")]
#[command(about = "Local HTTP service for the adaptive geolocation accuracy controller")]
struct Args {
    #[arg(long, default_value = "./geo_accuracy.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// YAML file with controller tuning and tenant ceilings.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, error_kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind,
            error: message.into(),
        }
    }

    fn storage(err: &anyhow::Error) -> Self {
        warn!(error = %format!("{err:#}"), "database operation failed");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "storage", format!("{err:#}"))
    }
}

impl From<CheckInError> for ServiceError {
    fn from(err: CheckInError) -> Self {
        let status = match &err {
            CheckInError::CeilingUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CheckInError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run synchronous `SQLite` work off the async executor.
async fn blocking<T, F>(state: &ServiceState, work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteApi) -> Result<T, ServiceError> + Send + 'static,
{
    let api = Arc::clone(&state.api);
    tokio::task::spawn_blocking(move || work(&api)).await.map_err(|err| {
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    })?
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/check-in", post(check_in))
        .route("/v1/stats/show", post(stats_show))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let settings = AccuracySettings::load(args.config.as_deref())
        .context("failed to load accuracy settings")?;
    let api = AccuracyApi::open_sqlite(&args.db, &settings, settings.ceilings.clone())?;
    let migrated = api.migrate(false)?;
    info!(
        db = %args.db.display(),
        schema_version = migrated.after_version.unwrap_or(migrated.current_version),
        "database ready"
    );

    let state = ServiceState { api: Arc::new(api) };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "geo accuracy service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status =
        blocking(&state, |api| api.schema_status().map_err(|err| ServiceError::storage(&err)))
            .await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = blocking(&state, move |api| {
        api.migrate(request.dry_run).map_err(|err| ServiceError::storage(&err))
    })
    .await?;
    Ok(Json(envelope(result)))
}

async fn check_in(
    State(state): State<ServiceState>,
    Json(request): Json<CheckInRequest>,
) -> Result<Json<ServiceEnvelope<CheckInOutcome>>, ServiceError> {
    let outcome = blocking(&state, move |api| Ok(api.check_in(request)?)).await?;
    Ok(Json(envelope(outcome)))
}

async fn stats_show(
    State(state): State<ServiceState>,
    Json(request): Json<StatShowRequest>,
) -> Result<Json<ServiceEnvelope<Option<AccuracyStat>>>, ServiceError> {
    let stat = blocking(&state, move |api| Ok(api.stat_show(&request.context)?)).await?;
    Ok(Json(envelope(stat)))
}
