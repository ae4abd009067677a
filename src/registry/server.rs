use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::RegistryError;
use crate::registry::{KeyValue, Lease, Precondition, Registry, WatchEvent};

/// Upper bound on a single long-poll so idle connections are recycled.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

/// Error body shared by the server and [`RemoteRegistry`](super::remote::RemoteRegistry)
/// so registry errors survive the round trip with their kind intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum WireError {
    Conflict { key: String },
    NotFound { key: String },
    CursorCompacted { requested: u64, oldest: u64 },
    Timeout { millis: u64 },
    Unavailable { reason: String },
    Codec { reason: String },
}

impl From<&RegistryError> for WireError {
    fn from(e: &RegistryError) -> Self {
        match e {
            RegistryError::Conflict { key } => Self::Conflict { key: key.clone() },
            RegistryError::NotFound(key) => Self::NotFound { key: key.clone() },
            RegistryError::CursorCompacted { requested, oldest } => Self::CursorCompacted {
                requested: *requested,
                oldest: *oldest,
            },
            RegistryError::Timeout(d) => Self::Timeout {
                millis: d.as_millis() as u64,
            },
            RegistryError::Unavailable(reason) => Self::Unavailable {
                reason: reason.clone(),
            },
            RegistryError::Codec(e) => Self::Codec {
                reason: e.to_string(),
            },
        }
    }
}

impl From<WireError> for RegistryError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Conflict { key } => Self::Conflict { key },
            WireError::NotFound { key } => Self::NotFound(key),
            WireError::CursorCompacted { requested, oldest } => {
                Self::CursorCompacted { requested, oldest }
            }
            WireError::Timeout { millis } => Self::Timeout(Duration::from_millis(millis)),
            WireError::Unavailable { reason } => Self::Unavailable(reason),
            // The remote side could not decode something; nothing local to
            // retry against.
            WireError::Codec { reason } => Self::Unavailable(format!("remote codec error: {reason}")),
        }
    }
}

struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RegistryError::Conflict { .. } => StatusCode::CONFLICT,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::CursorCompacted { .. } => StatusCode::GONE,
            RegistryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RegistryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Codec(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(WireError::from(&self.0))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrefixQuery {
    pub prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitQuery {
    pub prefix: String,
    pub after: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: String,
    pub precondition: Precondition,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetResponse {
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: String,
    pub precondition: Precondition,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexResponse {
    pub index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub key: String,
    pub value: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenewRequest {
    pub lease: Lease,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub lease: Lease,
}

/// Routes exposing a [`Registry`] over HTTP.
pub fn router(registry: Arc<dyn Registry>) -> Router {
    Router::new()
        .route("/registry/key", get(get_handler))
        .route("/registry/list", get(list_handler))
        .route("/registry/set", post(set_handler))
        .route("/registry/delete", post(delete_handler))
        .route("/registry/wait", get(wait_handler))
        .route("/registry/index", get(index_handler))
        .route("/registry/lease/acquire", post(acquire_handler))
        .route("/registry/lease/renew", post(renew_handler))
        .route("/registry/lease/release", post(release_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serve the registry on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<dyn Registry>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting registry server");

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "Registry server stopped");
    Ok(())
}

async fn get_handler(
    State(registry): State<Arc<dyn Registry>>,
    Query(q): Query<KeyQuery>,
) -> Result<Json<Option<KeyValue>>, ApiError> {
    Ok(Json(registry.get(&q.key).await?))
}

async fn list_handler(
    State(registry): State<Arc<dyn Registry>>,
    Query(q): Query<PrefixQuery>,
) -> Result<Json<Vec<KeyValue>>, ApiError> {
    Ok(Json(registry.list(&q.prefix).await?))
}

async fn set_handler(
    State(registry): State<Arc<dyn Registry>>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>, ApiError> {
    let version = registry.set(&req.key, &req.value, req.precondition).await?;
    Ok(Json(SetResponse { version }))
}

async fn delete_handler(
    State(registry): State<Arc<dyn Registry>>,
    Json(req): Json<DeleteRequest>,
) -> Result<StatusCode, ApiError> {
    registry.delete(&req.key, req.precondition).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn wait_handler(
    State(registry): State<Arc<dyn Registry>>,
    Query(q): Query<WaitQuery>,
) -> Result<Json<Option<WatchEvent>>, ApiError> {
    let timeout = Duration::from_millis(q.timeout_ms).min(MAX_WAIT);
    Ok(Json(registry.wait(&q.prefix, q.after, timeout).await?))
}

async fn index_handler(
    State(registry): State<Arc<dyn Registry>>,
) -> Result<Json<IndexResponse>, ApiError> {
    Ok(Json(IndexResponse {
        index: registry.current_index().await?,
    }))
}

async fn acquire_handler(
    State(registry): State<Arc<dyn Registry>>,
    Json(req): Json<AcquireRequest>,
) -> Result<Json<Option<Lease>>, ApiError> {
    let ttl = Duration::from_millis(req.ttl_ms);
    Ok(Json(registry.acquire_lease(&req.key, &req.value, ttl).await?))
}

async fn renew_handler(
    State(registry): State<Arc<dyn Registry>>,
    Json(req): Json<RenewRequest>,
) -> Result<Json<Option<Lease>>, ApiError> {
    let ttl = Duration::from_millis(req.ttl_ms);
    Ok(Json(registry.renew_lease(&req.lease, ttl).await?))
}

async fn release_handler(
    State(registry): State<Arc<dyn Registry>>,
    Json(req): Json<ReleaseRequest>,
) -> Result<StatusCode, ApiError> {
    registry.release_lease(&req.lease).await?;
    Ok(StatusCode::NO_CONTENT)
}
