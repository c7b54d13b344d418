//! Context management endpoints
//!
//! CRUD over pooled contexts plus the out-of-band driving endpoints used
//! by captcha flows: a caller acquires a context to take it out of the
//! scheduling rotation, drives its page directly, then releases it.

use axum::Json;
use axum::extract::{Path, Query, State};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::driver::{ScreenshotFormat, ScreenshotOptions, WaitUntil};
use crate::error::PoolError;
use crate::pool::{ContextInfo, ScraperPool};
use crate::scrape::DEFAULT_TIMEOUT_MS;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Comma-separated tag filter; only contexts carrying all of them.
    #[serde(default)]
    pub tags: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ContextListResponse {
    pub contexts: Vec<ContextInfo>,
}

/// `GET /contexts`
pub async fn list(
    State(pool): State<Arc<ScraperPool>>,
    Query(query): Query<ListQuery>,
) -> Json<ContextListResponse> {
    let required: Option<HashSet<String>> = query.tags.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    });
    let contexts = pool.registry().list_contexts(required.as_ref()).await;
    Json(ContextListResponse { contexts })
}

#[derive(Debug, Deserialize)]
pub struct ContextCreate {
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `POST /contexts`
pub async fn create(
    State(pool): State<Arc<ScraperPool>>,
    Json(body): Json<ContextCreate>,
) -> Result<Json<ContextInfo>, ApiError> {
    let ctx = pool
        .registry()
        .create_context(body.proxy, body.persistent, &body.tags)
        .await?;
    Ok(Json(ctx.info()))
}

/// `DELETE /contexts/{id}` — 409 while the context is in use.
pub async fn remove(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = pool.registry().remove_context(id).await?;
    if removed {
        Ok(Json(serde_json::json!({ "removed": id })))
    } else {
        Err(PoolError::ContextNotFound(id).into())
    }
}

#[derive(Debug, Deserialize)]
pub struct TagsPatch {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// `PATCH /contexts/{id}/tags`
pub async fn patch_tags(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
    Json(body): Json<TagsPatch>,
) -> Result<Json<ContextInfo>, ApiError> {
    if !body.add.is_empty() {
        pool.registry().add_tags(id, &body.add).await?;
    }
    if !body.remove.is_empty() {
        pool.registry().remove_tags(id, &body.remove).await?;
    }
    let ctx = pool
        .registry()
        .get_context(id)
        .await
        .ok_or(PoolError::ContextNotFound(id))?;
    Ok(Json(ctx.info()))
}

/// `POST /contexts/{id}/acquire` — take the context out of rotation.
pub async fn acquire(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContextInfo>, ApiError> {
    let ctx = pool.registry().acquire_context(id).await?;
    Ok(Json(ctx.info()))
}

/// `POST /contexts/{id}/release` — put it back and wake a queued waiter.
pub async fn release(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContextInfo>, ApiError> {
    let ctx = pool
        .registry()
        .release_context(id)
        .await
        .ok_or(PoolError::ContextNotFound(id))?;
    pool.offer_to_queue(&ctx).await;
    Ok(Json(ctx.info()))
}

#[derive(Debug, Deserialize)]
pub struct GotoRequest {
    pub url: String,
    #[serde(default)]
    pub wait_until: WaitUntil,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GotoResponse {
    pub url: String,
    pub status: Option<u16>,
}

/// `POST /contexts/{id}/goto`
pub async fn goto(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
    Json(body): Json<GotoRequest>,
) -> Result<Json<GotoResponse>, ApiError> {
    let ctx = pool
        .registry()
        .get_context(id)
        .await
        .ok_or(PoolError::ContextNotFound(id))?;
    let timeout =
        std::time::Duration::from_millis(body.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    let nav = pool
        .driver()
        .navigate(ctx.driver(), &body.url, timeout, body.wait_until)
        .await
        .map_err(PoolError::from)?;
    Ok(Json(GotoResponse {
        url: nav.final_url,
        status: nav.status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub script: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub result: Option<serde_json::Value>,
}

/// `POST /contexts/{id}/execute`
pub async fn execute(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let ctx = pool
        .registry()
        .get_context(id)
        .await
        .ok_or(PoolError::ContextNotFound(id))?;
    let timeout =
        std::time::Duration::from_millis(body.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    let result = tokio::time::timeout(timeout, pool.driver().evaluate(ctx.driver(), &body.script))
        .await
        .map_err(|_| ApiError::unprocessable("script evaluation timed out"))?
        .map_err(PoolError::from)?;
    Ok(Json(ExecuteResponse {
        result: Some(result),
    }))
}

#[derive(Debug, Deserialize, Default)]
pub struct ScreenshotRequest {
    #[serde(default)]
    pub full_page: bool,
    #[serde(default)]
    pub format: ScreenshotFormat,
    #[serde(default)]
    pub quality: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct ScreenshotResponse {
    /// Base64-encoded image bytes.
    pub screenshot: String,
}

/// `POST /contexts/{id}/screenshot`
pub async fn screenshot(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ScreenshotRequest>,
) -> Result<Json<ScreenshotResponse>, ApiError> {
    let ctx = pool
        .registry()
        .get_context(id)
        .await
        .ok_or(PoolError::ContextNotFound(id))?;
    let opts = ScreenshotOptions {
        full_page: body.full_page,
        format: body.format,
        quality: body.quality,
    };
    let bytes = pool
        .driver()
        .screenshot(ctx.driver(), &opts)
        .await
        .map_err(PoolError::from)?;
    Ok(Json(ScreenshotResponse {
        screenshot: BASE64.encode(bytes),
    }))
}

#[derive(Debug, Serialize)]
pub struct ContentResponse {
    pub content: String,
}

/// `GET /contexts/{id}/content`
pub async fn content(
    State(pool): State<Arc<ScraperPool>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContentResponse>, ApiError> {
    let ctx = pool
        .registry()
        .get_context(id)
        .await
        .ok_or(PoolError::ContextNotFound(id))?;
    let html = pool
        .driver()
        .content(ctx.driver())
        .await
        .map_err(PoolError::from)?;
    Ok(Json(ContentResponse { content: html }))
}
