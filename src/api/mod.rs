//! Read-only HTTP API over the registry.
//!
//! Every listing is paged with an opaque `nextPageToken`; see [`page`].

pub mod page;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::FleetError;
use crate::job::JobState;
use crate::machine::MachineState;
use crate::registry::RegistryClient;
use crate::unit::{UnitState, UnitStatus};

pub use page::{paginate, PageToken};

#[derive(Clone)]
pub struct ApiState {
    pub client: RegistryClient,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StateQuery {
    #[serde(rename = "machineID")]
    pub machine_id: Option<String>,
    #[serde(rename = "unitName")]
    pub unit_name: Option<String>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatePage {
    pub states: Vec<UnitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// A job with its target state and what its machine last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitView {
    pub name: String,
    pub desired_state: JobState,
    pub current_state: Option<UnitStatus>,
    pub machine_id: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPage {
    pub units: Vec<UnitView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePage {
    pub machines: Vec<MachineState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
}

pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl From<crate::error::RegistryError> for ApiError {
    fn from(e: crate::error::RegistryError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            FleetError::InvalidPageToken(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            other => {
                tracing::error!(error = %other, "API request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        error_response(status, message)
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code: status.as_u16(),
            message,
        },
    };
    (status, Json(body)).into_response()
}

async fn method_not_allowed() -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "only GET is supported".to_string(),
    )
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/state", get(list_states).fallback(method_not_allowed))
        .route("/v1/units", get(list_units).fallback(method_not_allowed))
        .route("/v1/machines", get(list_machines).fallback(method_not_allowed))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `listener` until `cancel` fires.
pub async fn run_api(
    listener: TcpListener,
    client: RegistryClient,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(ApiState { client }))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "API server stopped");
    Ok(())
}

fn token(raw: Option<&str>) -> Result<PageToken, FleetError> {
    match raw {
        Some(raw) if !raw.is_empty() => PageToken::decode(raw),
        _ => Ok(PageToken::default()),
    }
}

async fn list_states(
    State(state): State<ApiState>,
    Query(q): Query<StateQuery>,
) -> Result<Json<UnitStatePage>, ApiError> {
    let tok = token(q.next_page_token.as_deref())?;

    let filtered: Vec<UnitState> = state
        .client
        .unit_states()
        .await?
        .into_iter()
        .filter(|s| q.machine_id.as_deref().map_or(true, |m| m.is_empty() || s.machine_id == m))
        .filter(|s| q.unit_name.as_deref().map_or(true, |n| n.is_empty() || s.name == n))
        .collect();

    let (states, next) = paginate(filtered, tok);
    Ok(Json(UnitStatePage {
        states,
        next_page_token: next.map(|t| t.encode()),
    }))
}

async fn list_units(
    State(state): State<ApiState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<UnitPage>, ApiError> {
    let tok = token(q.next_page_token.as_deref())?;

    let jobs = state.client.jobs().await?;
    let mut observed = state.client.job_states().await?;
    let views: Vec<UnitView> = jobs
        .into_iter()
        .map(|job| {
            let seen = observed.remove(&job.name);
            UnitView {
                desired_state: job.target_state,
                current_state: seen.as_ref().and_then(|s| s.state),
                machine_id: seen.as_ref().and_then(|s| s.machine_id.clone()),
                hostname: seen.and_then(|s| s.hostname),
                name: job.name,
            }
        })
        .collect();

    let (units, next) = paginate(views, tok);
    Ok(Json(UnitPage {
        units,
        next_page_token: next.map(|t| t.encode()),
    }))
}

async fn list_machines(
    State(state): State<ApiState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<MachinePage>, ApiError> {
    let tok = token(q.next_page_token.as_deref())?;

    let (machines, next) = paginate(state.client.machines().await?, tok);
    Ok(Json(MachinePage {
        machines,
        next_page_token: next.map(|t| t.encode()),
    }))
}
