use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use navigator_api::{
    load_taxonomy, DashboardApi, DashboardError, IngestConfig, ReaggregateOutcome, UploadRequest,
    API_CONTRACT_VERSION,
};
use navigator_core::{BatchId, DashboardView, IngestReport, ViewPayload};
use navigator_store_sqlite::BatchSummary;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const ORGANIZATION_HEADER: &str = "x-organization-id";
const READ_FAILURE_MESSAGE: &str = "Failed to load dashboard data.";
const WRITE_FAILURE_MESSAGE: &str = "Failed to process upload.";
// Room for multipart boundaries and the organization field on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct ServiceState {
    api: DashboardApi,
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
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    taxonomy_version: String,
}

#[derive(Debug, Clone, Serialize)]
struct UploadResponse {
    message: String,
    batch_id: BatchId,
    report: IngestReport,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OrganizationQuery {
    organization: Option<String>,
    batch: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "navigator-service")]
#[command(about = "HTTP backend for the Family Navigator dashboard")]
struct Args {
    #[arg(long, default_value = "./famnav.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Taxonomy JSON document; the embedded survey is used when omitted.
    #[arg(long)]
    taxonomy: Option<PathBuf>,
    #[arg(long, default_value_t = 0.2)]
    max_invalid_ratio: f64,
    #[arg(long, default_value_t = 30)]
    upload_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_upload_bytes: usize,
    #[arg(long, default_value_t = ',')]
    delimiter: char,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: message.into() }
    }

    /// Map an API failure; internal failures are logged and replaced by `internal_message`.
    fn from_dashboard(err: DashboardError, internal_message: &str) -> Self {
        let status = match &err {
            DashboardError::NotCsv
            | DashboardError::EmptyFile
            | DashboardError::InvalidOrganization(_)
            | DashboardError::Survey(_) => StatusCode::BAD_REQUEST,
            DashboardError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DashboardError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            DashboardError::StoreConflict { .. } => StatusCode::CONFLICT,
            DashboardError::BatchNotFound(_) | DashboardError::NoCurrentBatch(_) => {
                StatusCode::NOT_FOUND
            }
            DashboardError::Store(_) => {
                tracing::error!(error = %format!("{err:#}"), "store failure");
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    error: internal_message.to_string(),
                };
            }
        };
        Self { status, error: err.to_string() }
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
    let body_limit = state.api.config().max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);
    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/api/csv-upload", post(csv_upload).layer(DefaultBodyLimit::max(body_limit)))
        .route("/api/batches", get(batches))
        .route("/api/reaggregate", post(reaggregate));

    for view in DashboardView::ALL {
        router = router.route(
            &format!("/api/{}", view.as_str()),
            get(
                move |State(state): State<ServiceState>,
                      headers: HeaderMap,
                      Query(query): Query<OrganizationQuery>| {
                    dashboard_view(state, view, headers, query)
                },
            ),
        );
    }

    router.with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let delimiter = u8::try_from(args.delimiter)
        .map_err(|_| anyhow::anyhow!("delimiter must be a single-byte character"))?;
    let taxonomy = load_taxonomy(args.taxonomy.as_deref())?;
    tracing::info!(
        taxonomy_version = %taxonomy.version,
        fingerprint = %taxonomy.fingerprint(),
        "taxonomy loaded"
    );

    let config = IngestConfig {
        delimiter,
        max_invalid_ratio: args.max_invalid_ratio,
        upload_timeout: Duration::from_secs(args.upload_timeout_secs),
        max_upload_bytes: args.max_upload_bytes,
        ..IngestConfig::default()
    };
    let api = DashboardApi::new(args.db, Arc::new(taxonomy), config);
    api.migrate(false)?;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "navigator service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

/// Organization from the session header, falling back to the query string.
fn organization_id(headers: &HeaderMap, query: &OrganizationQuery) -> Result<String, ServiceError> {
    headers
        .get(ORGANIZATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| query.organization.clone())
        .ok_or_else(|| ServiceError::bad_request("organization is required"))
}

fn batch_id(query: &OrganizationQuery) -> Result<Option<BatchId>, ServiceError> {
    query
        .batch
        .as_deref()
        .map(|raw| {
            BatchId::parse(raw).ok_or_else(|| ServiceError::bad_request(format!("invalid batch id: {raw}")))
        })
        .transpose()
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        taxonomy_version: state.api.taxonomy().version.clone(),
    })
}

async fn dashboard_view(
    state: ServiceState,
    view: DashboardView,
    headers: HeaderMap,
    query: OrganizationQuery,
) -> Result<Json<ViewPayload>, ServiceError> {
    let organization = organization_id(&headers, &query)?;
    let batch = batch_id(&query)?;
    let payload =
        run_blocking(&state, READ_FAILURE_MESSAGE, move |api| api.view(&organization, view, batch))
            .await?;
    Ok(Json(payload))
}

/// Run a store-touching API call off the async workers.
async fn run_blocking<T, F>(
    state: &ServiceState,
    internal_message: &'static str,
    call: F,
) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&DashboardApi) -> Result<T, DashboardError> + Send + 'static,
{
    let api = state.api.clone();
    tokio::task::spawn_blocking(move || call(&api))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "blocking api task failed");
            ServiceError { status: StatusCode::INTERNAL_SERVER_ERROR, error: internal_message.to_string() }
        })?
        .map_err(|err| ServiceError::from_dashboard(err, internal_message))
}

async fn csv_upload(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<OrganizationQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServiceError> {
    let mut organization = None;
    let mut file = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| ServiceError {
        status: err.status(),
        error: err.body_text(),
    })? {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|err| ServiceError {
                    status: err.status(),
                    error: err.body_text(),
                })?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("organization") => {
                let value = field.text().await.map_err(|err| ServiceError {
                    status: err.status(),
                    error: err.body_text(),
                })?;
                organization = Some(value.trim().to_string()).filter(|value| !value.is_empty());
            }
            _ => {}
        }
    }

    let organization_id = match organization {
        Some(organization) => organization,
        None => organization_id(&headers, &query)?,
    };
    let Some((filename, bytes)) = file else {
        return Err(ServiceError::bad_request(DashboardError::EmptyFile.to_string()));
    };

    let request = UploadRequest { organization_id, filename, bytes, delimiter: None };
    let outcome =
        run_blocking(&state, WRITE_FAILURE_MESSAGE, move |api| api.upload_csv(request)).await?;

    Ok(Json(UploadResponse {
        message: outcome.message,
        batch_id: outcome.batch_id,
        report: outcome.report,
    }))
}

async fn batches(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<OrganizationQuery>,
) -> Result<Json<ServiceEnvelope<Vec<BatchSummary>>>, ServiceError> {
    let organization = organization_id(&headers, &query)?;
    let history =
        run_blocking(&state, READ_FAILURE_MESSAGE, move |api| api.list_batches(&organization))
            .await?;
    Ok(Json(envelope(history)))
}

async fn reaggregate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<OrganizationQuery>,
) -> Result<Json<ServiceEnvelope<ReaggregateOutcome>>, ServiceError> {
    let organization = organization_id(&headers, &query)?;
    let outcome =
        run_blocking(&state, WRITE_FAILURE_MESSAGE, move |api| api.reaggregate(&organization))
            .await?;
    Ok(Json(envelope(outcome)))
}
