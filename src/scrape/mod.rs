//! Scrape request and result types
//!
//! The coordinator consumes a [`ScrapeRequest`] and produces a
//! [`ScrapeOutcome`]. Both are wire-agnostic: the HTTP edge validates
//! input and base64-encodes screenshots, nothing here does.

pub mod coordinator;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub use crate::driver::WaitUntil;

/// Default navigation / script timeout when the caller does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// One scrape, as handed to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequest {
    /// Target URL. The edge guarantees an http/https scheme.
    pub url: String,

    /// Tags a serving context must carry. Selection matches on these only;
    /// the proxy is deliberately not part of selection.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Proxy for a newly created context, when creation is needed.
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub wait_until: WaitUntil,

    /// Navigation and script timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Return the page HTML.
    #[serde(default = "default_true")]
    pub get_content: bool,

    /// Script to evaluate after navigation.
    #[serde(default)]
    pub script: Option<String>,

    /// Capture a screenshot.
    #[serde(default)]
    pub screenshot: bool,

    #[serde(default)]
    pub screenshot_full_page: bool,

    /// Per-request override of the per-domain delay.
    #[serde(default)]
    pub domain_delay_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl ScrapeRequest {
    /// Minimal request for a URL, everything else defaulted.
    #[must_use]
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tags: Vec::new(),
            proxy: None,
            wait_until: WaitUntil::default(),
            timeout_ms: None,
            get_content: true,
            script: None,
            screenshot: false,
            screenshot_full_page: false,
            domain_delay_ms: None,
        }
    }

    /// Effective timeout for navigation and script evaluation.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

/// What one scrape produced.
#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub success: bool,
    /// Final URL after redirects (the requested URL on failure).
    pub url: String,
    /// HTTP status of the main document, when observable.
    pub status: Option<u16>,
    pub content: Option<String>,
    /// JSON value the page script returned.
    pub script_result: Option<serde_json::Value>,
    /// Raw screenshot bytes; base64 happens at the edge.
    pub screenshot: Option<Vec<u8>>,
    /// Context that served the request.
    pub context_id: Uuid,
    /// Time spent waiting in the queue for a context.
    pub queue_wait: Duration,
    pub error: Option<String>,
}

impl ScrapeOutcome {
    pub(crate) fn failed(url: String, context_id: Uuid, error: String) -> Self {
        Self {
            success: false,
            url,
            status: None,
            content: None,
            script_result: None,
            screenshot: None,
            context_id,
            queue_wait: Duration::ZERO,
            error: Some(error),
        }
    }
}
