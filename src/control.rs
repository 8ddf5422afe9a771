//! Operator-facing control API.
//!
//! HTTP/JSON surface for workflow CRUD under `/v1`, plus the unauthenticated
//! `__status` and `__metrics` endpoints. Two independent auth gates can be
//! layered onto `/v1`: an API-key header compared by SHA-256 digest, and a
//! forwarded-client-cert header check.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use axum::{
    extract::rejection::JsonRejection,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{error, warn};

use crate::every::Every;
use crate::metrics;
use crate::store::{ControlStore, ListQuery, OrderBy, OrderDir, Workflow, WorkflowFields};

/// Request deadline for list queries.
const LIST_TIMEOUT: Duration = Duration::from_secs(15);

/// Authentication gates for the `/v1` routes. Both are optional and
/// independent; enabling both requires both to pass.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub api_key_enabled: bool,
    /// SHA-256 hex digest of the expected `x-api-key` value.
    pub api_key_sha256: String,
    pub xfcc_enabled: bool,
    /// Header carrying the forwarded client certificate.
    pub xfcc_header: String,
    /// Substring the forwarded cert must contain; empty means presence only.
    pub xfcc_must_contain: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_enabled: false,
            api_key_sha256: String::new(),
            xfcc_enabled: false,
            xfcc_header: "x-forwarded-client-cert".to_string(),
            xfcc_must_contain: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct ControlState {
    pub store: Arc<dyn ControlStore>,
    pub auth: AuthConfig,
    pub metrics: PrometheusHandle,
}

/// Serve the control API on `listener` until the process exits.
pub async fn run_control_server(listener: TcpListener, state: ControlState) -> AnyResult<()> {
    let app = control_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn control_router(state: ControlState) -> Router {
    let mut v1 = Router::new()
        .route("/workflow", put(put_workflow).delete(delete_workflow))
        .route("/workflow/:name", get(get_workflow))
        .route("/workflows", get(list_workflows));
    if state.auth.xfcc_enabled {
        v1 = v1.layer(middleware::from_fn_with_state(state.clone(), xfcc_auth));
    }
    if state.auth.api_key_enabled {
        v1 = v1.layer(middleware::from_fn_with_state(state.clone(), api_key_auth));
    }

    Router::new()
        .nest("/v1", v1)
        .route("/__status", get(server_status))
        .route("/__metrics", get(render_metrics))
        .layer(middleware::from_fn(metrics::track_http))
        .with_state(state)
}

// ============================================================================
// Request / response bodies
// ============================================================================

/// Workflow fields as they travel over the wire, for both the PUT request
/// and GET responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowBody {
    pub name: String,
    pub artifact: String,
    pub command: String,
    pub every: String,
    pub next_runtime: DateTime<Utc>,
    #[serde(default)]
    pub backfill: bool,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub schedule_delay_minutes: u32,
}

impl From<Workflow> for WorkflowBody {
    fn from(workflow: Workflow) -> Self {
        Self {
            name: workflow.name,
            artifact: workflow.artifact,
            command: workflow.command,
            every: workflow.every.to_string(),
            next_runtime: workflow.next_runtime,
            backfill: workflow.backfill,
            owner: workflow.owner,
            is_active: workflow.is_active,
            schedule_delay_minutes: workflow.schedule_delay_minutes as u32,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteWorkflowBody {
    name: String,
}

#[derive(Debug, Serialize)]
struct DeleteWorkflowResponse {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    order_by: Option<String>,
    order_dir: Option<String>,
    page: Option<String>,
    limit: Option<String>,
    like: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    data: Vec<WorkflowBody>,
    pagination: Pagination,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    total: i64,
    page: i64,
    limit: i64,
    total_pages: i64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "clientIP")]
    client_ip: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponseBody {
    error: String,
    code: String,
    message: String,
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    error: String,
    message: String,
}

impl HttpError {
    fn bad_request(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            message: message.into(),
        }
    }

    fn not_found(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: error.into(),
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Debug) -> Self {
        error!(?err, "control request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal_error".to_string(),
            message: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponseBody {
            error: self.error,
            code: self.status.as_u16().to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn put_workflow(
    State(state): State<ControlState>,
    payload: Result<Json<WorkflowBody>, JsonRejection>,
) -> Result<Json<&'static str>, HttpError> {
    let Json(body) = payload
        .map_err(|rejection| HttpError::bad_request("invalid_body", rejection.body_text()))?;
    let every: Every = body
        .every
        .parse()
        .map_err(|err| HttpError::bad_request("invalid_every", format!("{err}")))?;

    let fields = WorkflowFields {
        name: body.name,
        artifact: body.artifact,
        command: body.command,
        every,
        next_runtime: body.next_runtime,
        backfill: body.backfill,
        owner: body.owner,
        is_active: body.is_active,
        schedule_delay_minutes: i64::from(body.schedule_delay_minutes),
    };
    state
        .store
        .upsert_workflow(&fields)
        .await
        .map_err(HttpError::internal)?;
    Ok(Json("OK"))
}

async fn delete_workflow(
    State(state): State<ControlState>,
    payload: Result<Json<DeleteWorkflowBody>, JsonRejection>,
) -> Result<Json<DeleteWorkflowResponse>, HttpError> {
    let Json(body) = payload.map_err(|_| {
        HttpError::bad_request("invalid_body", "could not parse body")
    })?;
    let deleted = state
        .store
        .soft_delete_workflow(&body.name)
        .await
        .map_err(HttpError::internal)?;
    if !deleted {
        return Err(HttpError::not_found(
            "workflow_not_found",
            format!("no workflow named {:?}", body.name),
        ));
    }
    Ok(Json(DeleteWorkflowResponse { name: body.name }))
}

async fn get_workflow(
    State(state): State<ControlState>,
    Path(name): Path<String>,
) -> Result<Json<WorkflowBody>, HttpError> {
    let workflow = state
        .store
        .get_workflow(&name)
        .await
        .map_err(HttpError::internal)?
        .ok_or_else(|| {
            HttpError::not_found("workflow_not_found", format!("no workflow named {name:?}"))
        })?;
    Ok(Json(workflow.into()))
}

async fn list_workflows(
    State(state): State<ControlState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, HttpError> {
    let query = validate_list_params(params)?;

    let page = tokio::time::timeout(LIST_TIMEOUT, state.store.list_workflows(&query))
        .await
        .map_err(|_| HttpError::internal("list query timed out"))?
        .map_err(HttpError::internal)?;

    let total_pages = if page.total == 0 {
        0
    } else {
        (page.total + query.limit - 1) / query.limit
    };
    Ok(Json(ListResponse {
        data: page.workflows.into_iter().map(WorkflowBody::from).collect(),
        pagination: Pagination {
            total: page.total,
            page: query.page,
            limit: query.limit,
            total_pages,
        },
    }))
}

fn validate_list_params(params: ListParams) -> Result<ListQuery, HttpError> {
    let order_by = match params.order_by.as_deref() {
        None => OrderBy::Name,
        Some(field) => OrderBy::parse(field).ok_or_else(|| {
            HttpError::bad_request(
                "invalid_order_by_field",
                format!("invalid orderBy field: {field}"),
            )
        })?,
    };

    let order_dir = match params.order_dir.as_deref() {
        None => OrderDir::Asc,
        Some(dir) => OrderDir::parse(dir).ok_or_else(|| {
            HttpError::bad_request("invalid_order_direction", "orderDir must be 'asc' or 'desc'")
        })?,
    };

    let page = parse_positive(params.page, 1)
        .ok_or_else(|| HttpError::bad_request("invalid_page_value", "page must be a positive integer"))?;
    let limit = parse_positive(params.limit, 50).ok_or_else(|| {
        HttpError::bad_request("invalid_limit_value", "limit must be a positive integer")
    })?;

    let like = match params.like.filter(|pattern| !pattern.is_empty()) {
        None => None,
        Some(pattern) => {
            let valid = pattern
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
            if !valid {
                return Err(HttpError::bad_request(
                    "invalid_like_pattern",
                    "like pattern can only contain letters, numbers, underscore (_), and dot (.)",
                ));
            }
            Some(pattern)
        }
    };

    Ok(ListQuery {
        order_by,
        order_dir,
        page,
        limit,
        like,
    })
}

fn parse_positive(value: Option<String>, default: i64) -> Option<i64> {
    match value {
        None => Some(default),
        Some(raw) => match raw.parse::<i64>() {
            Ok(parsed) if parsed >= 1 => Some(parsed),
            _ => None,
        },
    }
}

async fn server_status(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> Json<StatusResponse> {
    Json(StatusResponse {
        client_ip: addr.ip().to_string(),
        status: "ok",
    })
}

async fn render_metrics(State(state): State<ControlState>) -> String {
    state.metrics.render()
}

// ============================================================================
// Auth middleware
// ============================================================================

async fn api_key_auth(
    State(state): State<ControlState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let digest = format!("{:x}", Sha256::digest(provided.as_bytes()));
    if digest != state.auth.api_key_sha256 {
        warn!("api key mismatch");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

async fn xfcc_auth(State(state): State<ControlState>, request: Request, next: Next) -> Response {
    let forwarded = request
        .headers()
        .get(state.auth.xfcc_header.as_str())
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let must_contain = state.auth.xfcc_must_contain.as_str();
    if forwarded.is_empty() || (!must_contain.is_empty() && !forwarded.contains(must_contain)) {
        warn!(header = state.auth.xfcc_header.as_str(), "forwarded cert mismatch");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}
