//! HTTP surface.
//!
//! ```text
//! POST /users            {"name", "email"}  -> 201 user | 400 | 500
//! GET  /users/get?id=N                      -> 200 user | 400 | 404
//! GET  /health                              -> 200 {"status":"ok"}
//! ```
//!
//! Every request runs in a span tagged with a correlation id taken from
//! `X-Correlation-ID` or generated, and echoed back on the response.

use axum::{
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, Instrument};

use crate::model::{CreateUserParams, User};
use crate::service::{ServiceError, UserOperations};

/// Header carrying the request correlation id.
pub const CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserOperations>,
}

impl AppState {
    pub fn new(users: Arc<dyn UserOperations>) -> Self {
        Self { users }
    }
}

/// Errors returned to HTTP clients as plain text.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// Details are logged where the error is produced, never sent.
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            ServiceError::Internal(source) => {
                error!(error = %source, "Request failed");
                ApiError::Internal
            }
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", post(create_user))
        .route("/users/get", get(get_user))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(correlation_middleware))
        .with_state(state)
}

async fn correlation_middleware(req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(&CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        correlation_id = %correlation_id
    );

    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserParams>, JsonRejection>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let Json(params) = payload.map_err(|rejection| {
        debug!(error = %rejection, "Rejected request body");
        ApiError::BadRequest("Invalid JSON".to_string())
    })?;

    let user = state.users.create_user(params).await?;

    info!(user_id = user.id, "User created");
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    id: Option<String>,
}

async fn get_user(
    State(state): State<AppState>,
    query: Option<Query<UserQuery>>,
) -> Result<Json<User>, ApiError> {
    let raw = query
        .and_then(|Query(q)| q.id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("ID parameter is required".to_string()))?;

    let id: i64 = raw
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid ID parameter".to_string()))?;

    let user = state.users.get_user(id).await?;
    Ok(Json(user))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
