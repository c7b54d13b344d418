//! Pool status endpoints.

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use std::sync::Arc;

use crate::pool::ScraperPool;

#[derive(Debug, Serialize)]
pub struct PoolStatusResponse {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    pub queued: usize,
    pub cdp_port: u16,
    pub cdp_endpoint: String,
    pub is_started: bool,
}

/// `GET /pool/status`
pub async fn status(State(pool): State<Arc<ScraperPool>>) -> Json<PoolStatusResponse> {
    let size = pool.registry().size().await;
    let available = pool.registry().available_count().await;
    Json(PoolStatusResponse {
        size,
        available,
        in_use: size - available,
        queued: pool.queue().len().await,
        cdp_port: pool.settings().cdp_port,
        cdp_endpoint: pool.cdp_endpoint(),
        is_started: pool.is_started(),
    })
}

#[derive(Debug, Serialize)]
pub struct CdpResponse {
    pub endpoint: String,
    pub port: u16,
}

/// `GET /pool/cdp` — WebSocket endpoint for external CDP tools such as
/// captcha solvers.
pub async fn cdp(State(pool): State<Arc<ScraperPool>>) -> Json<CdpResponse> {
    Json(CdpResponse {
        endpoint: pool.cdp_endpoint(),
        port: pool.settings().cdp_port,
    })
}
