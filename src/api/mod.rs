//! HTTP control surface
//!
//! Thin axum layer over the pool. Handlers validate input, call the same
//! public pool methods the tests use, and map [`PoolError`] kinds onto
//! status classes. Nothing here holds pool state of its own.

pub mod contexts;
pub mod pool;
pub mod scrape;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::error::PoolError;
use crate::pool::ScraperPool;

/// Build the service router.
pub fn router(pool: Arc<ScraperPool>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/scrape", post(scrape::scrape))
        .route("/contexts", get(contexts::list).post(contexts::create))
        .route("/contexts/{id}", delete(contexts::remove))
        .route("/contexts/{id}/tags", patch(contexts::patch_tags))
        .route("/contexts/{id}/acquire", post(contexts::acquire))
        .route("/contexts/{id}/release", post(contexts::release))
        .route("/contexts/{id}/goto", post(contexts::goto))
        .route("/contexts/{id}/execute", post(contexts::execute))
        .route("/contexts/{id}/screenshot", post(contexts::screenshot))
        .route("/contexts/{id}/content", get(contexts::content))
        .route("/pool/status", get(pool::status))
        .route("/pool/cdp", get(pool::cdp))
        .with_state(pool)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "scrapepool context pool service" }))
}

async fn healthz(
    axum::extract::State(pool): axum::extract::State<Arc<ScraperPool>>,
) -> Json<serde_json::Value> {
    Json(json!({
        "status": if pool.is_started() { "ok" } else { "stopped" },
        "contexts": pool.registry().size().await,
        "available_contexts": pool.registry().available_count().await,
        "cdp_port": pool.settings().cdp_port,
    }))
}

/// Error payload returned by every endpoint.
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let status = match &err {
            PoolError::ContextNotFound(_) => StatusCode::NOT_FOUND,
            PoolError::ContextNotAvailable(_)
            | PoolError::ContextInUse(_)
            | PoolError::PoolFull(_) => StatusCode::CONFLICT,
            PoolError::NotStarted | PoolError::QueueTimeout(_) | PoolError::Driver(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, err.to_string())
    }
}
