//! Unified scrape endpoint.

use axum::Json;
use axum::extract::State;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::pool::ScraperPool;
use crate::scrape::{ScrapeOutcome, ScrapeRequest};

use super::ApiError;

/// Allowed navigation/script timeout range, milliseconds.
const TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u64> = 1_000..=120_000;

#[derive(Debug, Serialize)]
pub struct ScrapeResponse {
    pub success: bool,
    pub url: String,
    pub status: Option<u16>,
    pub content: Option<String>,
    pub script_result: Option<serde_json::Value>,
    /// Base64-encoded screenshot bytes.
    pub screenshot: Option<String>,
    pub context_id: Uuid,
    pub queue_wait_ms: u64,
    pub error: Option<String>,
}

impl From<ScrapeOutcome> for ScrapeResponse {
    fn from(outcome: ScrapeOutcome) -> Self {
        Self {
            success: outcome.success,
            url: outcome.url,
            status: outcome.status,
            content: outcome.content,
            script_result: outcome.script_result,
            screenshot: outcome.screenshot.map(|bytes| BASE64.encode(bytes)),
            context_id: outcome.context_id,
            queue_wait_ms: outcome.queue_wait.as_millis() as u64,
            error: outcome.error,
        }
    }
}

/// `POST /scrape` — select or create a context, drive it, return the result.
pub async fn scrape(
    State(pool): State<Arc<ScraperPool>>,
    Json(body): Json<ScrapeRequest>,
) -> Result<Json<ScrapeResponse>, ApiError> {
    validate(&body)?;
    let outcome = pool.scrape(body).await?;
    Ok(Json(outcome.into()))
}

fn validate(request: &ScrapeRequest) -> Result<(), ApiError> {
    let scheme_ok = request.url.starts_with("http://") || request.url.starts_with("https://");
    if !scheme_ok {
        return Err(ApiError::unprocessable("url must be http or https"));
    }
    if url::Url::parse(&request.url).is_err() {
        return Err(ApiError::unprocessable("url is not a valid URL"));
    }
    if let Some(timeout_ms) = request.timeout_ms
        && !TIMEOUT_RANGE_MS.contains(&timeout_ms)
    {
        return Err(ApiError::unprocessable(format!(
            "timeout_ms must be within {}..={}",
            TIMEOUT_RANGE_MS.start(),
            TIMEOUT_RANGE_MS.end()
        )));
    }
    Ok(())
}
