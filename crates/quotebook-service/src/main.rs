use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use quotebook_api::{
    AddQuoteRequest, ExportResult, ImportResult, MigrateResult, QuoteListing, QuotebookApi,
    RandomQuote, SelectionResult, SyncReport, API_CONTRACT_VERSION,
};
use quotebook_core::{CategoryEntry, MergeKey};
use quotebook_remote::{RemoteConfig, DEFAULT_FETCH_LIMIT, DEFAULT_REMOTE_URL, DEFAULT_TIMEOUT_SECS};
use quotebook_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: QuotebookApi,
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
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryQuery {
    category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AddQuoteBody {
    text: String,
    #[serde(default)]
    category: String,
    #[serde(default = "default_push")]
    push: bool,
}

fn default_push() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct SelectionBody {
    category: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ImportQuery {
    #[serde(default)]
    merge_key: MergeKey,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "quotebook-service")]
#[command(about = "Local HTTP service for Quotebook")]
struct Args {
    #[arg(long, env = "QUOTEBOOK_DB", default_value = "./quotebook.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "QUOTEBOOK_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "QUOTEBOOK_REMOTE_URL", default_value = DEFAULT_REMOTE_URL)]
    remote_url: String,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT)]
    remote_limit: usize,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    remote_timeout_secs: u64,
    /// Seconds between background syncs; 0 disables the timer.
    #[arg(long, env = "QUOTEBOOK_SYNC_INTERVAL_SECS", default_value_t = 15)]
    sync_interval_secs: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    /// Run one API call on the blocking pool; storage and remote calls block.
    async fn call<T, F>(&self, work: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&QuotebookApi) -> Result<T> + Send + 'static,
    {
        let api = self.api.clone();
        tokio::task::spawn_blocking(move || work(&api))
            .await
            .map_err(|err| Self::error(format!("worker task failed: {err}")))?
            .map_err(|err| Self::error(format!("{err:#}")))
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/quotes", get(quotes_list).post(quotes_add))
        .route("/v1/quotes/random", get(quotes_random))
        .route("/v1/categories", get(categories_list))
        .route("/v1/selection", post(selection_set))
        .route("/v1/import", post(quotes_import))
        .route("/v1/export", get(quotes_export))
        .route("/v1/sync", post(sync_now))
        .with_state(state)
}

/// Run [`QuotebookApi::sync`] every `interval`, starting one interval from now.
fn spawn_sync_loop(api: QuotebookApi, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let api = api.clone();
            match tokio::task::spawn_blocking(move || api.sync()).await {
                Ok(Ok(report)) => {
                    tracing::debug!(outcome = report.outcome.as_str(), "periodic sync finished");
                }
                Ok(Err(err)) => tracing::warn!(error = %format!("{err:#}"), "periodic sync errored"),
                Err(err) => tracing::warn!(error = %err, "periodic sync task failed"),
            }
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = RemoteConfig {
        base_url: args.remote_url,
        limit: args.remote_limit,
        timeout: Duration::from_secs(args.remote_timeout_secs),
        ..RemoteConfig::default()
    };
    let api = QuotebookApi::with_remote_config(args.db, config);
    api.migrate(false)?;

    if args.sync_interval_secs > 0 {
        let _sync_loop = spawn_sync_loop(api.clone(), Duration::from_secs(args.sync_interval_secs));
    } else {
        tracing::info!("periodic sync disabled");
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "quotebook service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
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
    let status = state.call(QuotebookApi::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.call(move |api| api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

async fn quotes_list(
    State(state): State<ServiceState>,
    Query(query): Query<CategoryQuery>,
) -> Result<Json<ServiceEnvelope<QuoteListing>>, ServiceError> {
    let listing = state.call(move |api| api.list_quotes(query.category.as_deref())).await?;
    Ok(Json(envelope(listing)))
}

async fn quotes_add(
    State(state): State<ServiceState>,
    Json(body): Json<AddQuoteBody>,
) -> Result<Json<ServiceEnvelope<quotebook_api::AddQuoteResult>>, ServiceError> {
    let request = AddQuoteRequest { text: body.text, category: body.category, push: body.push };
    let result = state.call(move |api| api.add_quote(request)).await?;
    Ok(Json(envelope(result)))
}

async fn quotes_random(
    State(state): State<ServiceState>,
    Query(query): Query<CategoryQuery>,
) -> Result<Json<ServiceEnvelope<Option<RandomQuote>>>, ServiceError> {
    let picked = state.call(move |api| api.random_quote(query.category.as_deref())).await?;
    Ok(Json(envelope(picked)))
}

async fn categories_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<CategoryEntry>>>, ServiceError> {
    let categories = state.call(QuotebookApi::categories).await?;
    Ok(Json(envelope(categories)))
}

async fn selection_set(
    State(state): State<ServiceState>,
    Json(body): Json<SelectionBody>,
) -> Result<Json<ServiceEnvelope<SelectionResult>>, ServiceError> {
    let result = state.call(move |api| api.select_category(&body.category)).await?;
    Ok(Json(envelope(result)))
}

async fn quotes_import(
    State(state): State<ServiceState>,
    Query(query): Query<ImportQuery>,
    body: String,
) -> Result<Json<ServiceEnvelope<ImportResult>>, ServiceError> {
    let result = state.call(move |api| api.import_json(&body, query.merge_key)).await?;
    Ok(Json(envelope(result)))
}

async fn quotes_export(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ExportResult>>, ServiceError> {
    let export = state.call(QuotebookApi::export).await?;
    Ok(Json(envelope(export)))
}

async fn sync_now(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SyncReport>>, ServiceError> {
    let report = state.call(QuotebookApi::sync).await?;
    Ok(Json(envelope(report)))
}
