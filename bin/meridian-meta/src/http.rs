//! Node API
//!
//! JSON endpoints for clients and operators plus the binary journal and
//! image endpoints followers replicate from.

use crate::remote::HttpConnector;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use meridian_common::{Error, LeaderInfo, NodeEndpoint, NodeId, SequenceId};
use meridian_meta_store::journal::record::encode_batch;
use meridian_meta_store::{
    EntityKind, LeaderElection, LocalElection, Operation, RequestContext, StateCoordinator,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Carries the first retained sequence on `410 Gone` journal answers
pub const FIRST_AVAILABLE_HEADER: &str = "x-meridian-first-available";
const REQUEST_ID_HEADER: &str = "x-request-id";
const TIMEOUT_HEADER: &str = "x-timeout-ms";

const MAX_PULL_ENTRIES: usize = 4096;
const MAX_PULL_WAIT: Duration = Duration::from_secs(30);

/// Shared state of the node API
#[derive(Clone)]
pub struct AppState {
    pub coordinator: StateCoordinator,
    pub election: Arc<LocalElection>,
    pub connector: HttpConnector,
    /// Other members, told about appointments made on this node
    pub peers: Arc<Vec<NodeEndpoint>>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Build the node API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/status", get(status))
        // Writes (leader only)
        .route("/v1/operations", post(submit))
        .route("/v1/operations/batch", post(submit_batch))
        .route("/v1/operations/encoded", post(submit_encoded))
        .route("/v1/flush", post(flush))
        // Reads (any role)
        .route("/v1/entities/{kind}/{id}", get(read_entity))
        // Replication
        .route("/v1/journal", get(pull_journal))
        .route("/v1/checkpoint/latest", get(latest_image))
        .route("/v1/checkpoints", get(list_checkpoints))
        .route("/v1/checkpoints", post(create_checkpoint))
        // Election
        .route("/v1/election", get(current_leader))
        .route("/v1/election/appoint", post(appoint))
        .route("/v1/election/observe", post(observe))
        .route("/v1/election/partition", post(partition))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---- errors ----

/// Error envelope: `{"error": {"message": "...", "type": "...", "code": N}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub r#type: String,
    pub code: u16,
    /// Where to retry a write refused by a non-leader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<NodeEndpoint>,
}

/// A core error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

const fn error_type(e: &Error) -> &'static str {
    match e {
        Error::Durability { .. } => "Durability",
        Error::Consistency { .. } => "Consistency",
        Error::Fenced { .. } => "Fenced",
        Error::JournalTruncated { .. } => "JournalTruncated",
        Error::NotLeader { .. } => "NotLeader",
        Error::InvalidTransition { .. } => "InvalidTransition",
        Error::Halted(_) => "Halted",
        Error::Timeout { .. } => "Timeout",
        Error::LockTimeout { .. } => "LockTimeout",
        Error::InvalidOperation(_) => "InvalidOperation",
        Error::Checkpoint(_) => "Checkpoint",
        Error::VersionSkew { .. } => "VersionSkew",
        Error::Unavailable(_) => "Unavailable",
        Error::Io(_) => "Io",
        Error::Configuration(_) => "Configuration",
        Error::Serialization(_) => "Serialization",
        Error::Internal(_) => "Internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let leader = match &self.0 {
            Error::NotLeader { leader, .. } => leader.clone(),
            _ => None,
        };
        let first_available = match &self.0 {
            Error::JournalTruncated { first_available } => Some(*first_available),
            _ => None,
        };
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.0.to_string(),
                r#type: error_type(&self.0).to_string(),
                code: code.as_u16(),
                leader,
            },
        };

        let mut response = (code, Json(body)).into_response();
        if let Some(first) = first_available {
            response
                .headers_mut()
                .insert(FIRST_AVAILABLE_HEADER, HeaderValue::from(first));
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(Error::InvalidOperation(message.into()))
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---- health & metrics ----

async fn health(State(state): State<AppState>) -> Response {
    match state.coordinator.halted() {
        Some(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason).into_response(),
        None => (StatusCode::OK, "OK").into_response(),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.status())
}

// ---- writes ----

fn request_context(state: &AppState, headers: &HeaderMap) -> ApiResult<RequestContext> {
    let mut ctx = RequestContext::from_config(&state.coordinator.config().coordinator)
        .with_origin("http");
    if let Some(id) = headers.get(REQUEST_ID_HEADER) {
        let id = id
            .to_str()
            .map_err(|_| bad_request(format!("{REQUEST_ID_HEADER} is not valid text")))?;
        ctx = ctx.with_request_id(id);
    }
    if let Some(timeout) = headers.get(TIMEOUT_HEADER) {
        let ms = timeout
            .to_str()
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| bad_request(format!("{TIMEOUT_HEADER} must be milliseconds")))?;
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    Ok(ctx)
}

async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(op): Json<Operation>,
) -> ApiResult<impl IntoResponse> {
    let ctx = request_context(&state, &headers)?;
    let receipt = state.coordinator.submit(op, ctx).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn submit_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(ops): Json<Vec<Operation>>,
) -> ApiResult<impl IntoResponse> {
    let ctx = request_context(&state, &headers)?;
    let receipts = state.coordinator.submit_all(ops, ctx).await?;
    Ok((StatusCode::CREATED, Json(receipts)))
}

#[derive(Debug, Deserialize)]
struct EncodedParams {
    code: u32,
}

async fn submit_encoded(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<EncodedParams>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let ctx = request_context(&state, &headers)?;
    let receipt = state
        .coordinator
        .submit_encoded(params.code, &body, ctx)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Serialize)]
struct FlushResponse {
    sequence_id: SequenceId,
}

async fn flush(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let sequence_id = state.coordinator.flush().await?;
    Ok(Json(FlushResponse { sequence_id }))
}

// ---- reads ----

async fn read_entity(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, u64)>,
) -> ApiResult<Response> {
    let kind: EntityKind = kind.parse().map_err(bad_request)?;
    Ok(match state.coordinator.read_current(kind, id) {
        Some(entity) => Json(entity).into_response(),
        None => (StatusCode::NOT_FOUND, format!("{kind} {id} not found")).into_response(),
    })
}

// ---- replication ----

#[derive(Debug, Deserialize)]
struct PullParams {
    from: SequenceId,
    #[serde(default = "default_pull_max")]
    max: usize,
    #[serde(default)]
    wait_ms: u64,
}

const fn default_pull_max() -> usize {
    512
}

async fn pull_journal(
    State(state): State<AppState>,
    Query(params): Query<PullParams>,
) -> ApiResult<Response> {
    if params.from == 0 {
        return Err(bad_request("sequence ids start at 1"));
    }
    let wait = Duration::from_millis(params.wait_ms).min(MAX_PULL_WAIT);
    let entries = state
        .coordinator
        .pull_entries(params.from, params.max.clamp(1, MAX_PULL_ENTRIES), wait)
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        encode_batch(&entries),
    )
        .into_response())
}

async fn latest_image(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(match state.coordinator.latest_image().await? {
        Some(image) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            image,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[derive(Serialize)]
struct ImageListing {
    up_to_sequence: SequenceId,
    path: String,
}

async fn list_checkpoints(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let images = state.coordinator.checkpoints().list()?;
    let listing: Vec<ImageListing> = images
        .into_iter()
        .map(|(up_to_sequence, path)| ImageListing {
            up_to_sequence,
            path: path.display().to_string(),
        })
        .collect();
    Ok(Json(listing))
}

async fn create_checkpoint(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let info = state.coordinator.create_checkpoint().await?;
    Ok((StatusCode::CREATED, Json(info)))
}

// ---- election ----

async fn current_leader(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.election.current_leader())
}

#[derive(Debug, Deserialize)]
struct AppointRequest {
    node_id: u64,
}

async fn appoint(
    State(state): State<AppState>,
    Json(request): Json<AppointRequest>,
) -> ApiResult<impl IntoResponse> {
    let node_id = NodeId(request.node_id);
    let node = if node_id == state.coordinator.node().node_id {
        state.coordinator.node().clone()
    } else {
        state
            .peers
            .iter()
            .find(|p| p.node_id == node_id)
            .cloned()
            .ok_or_else(|| bad_request(format!("{node_id} is not a cluster member")))?
    };

    let leader = state.election.appoint(node);
    info!("Operator appointed {} in epoch {}", leader.node, leader.epoch);
    let connector = state.connector.clone();
    let peers = Arc::clone(&state.peers);
    let announced = leader.clone();
    tokio::spawn(async move { connector.announce(&peers, &announced).await });
    Ok(Json(leader))
}

async fn observe(
    State(state): State<AppState>,
    Json(leader): Json<LeaderInfo>,
) -> ApiResult<impl IntoResponse> {
    if state.election.observe(leader.clone()) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        warn!(
            "Ignoring stale announcement of {} in epoch {}",
            leader.node, leader.epoch
        );
        Err(ApiError(Error::Fenced {
            epoch: leader.epoch,
            fence: state.election.epoch(),
        }))
    }
}

async fn partition(State(state): State<AppState>) -> StatusCode {
    state.election.partition();
    StatusCode::NO_CONTENT
}
