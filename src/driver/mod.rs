//! Browser driver capability consumed by the pool
//!
//! The pool never talks to a browser directly; it goes through the
//! [`ContextDriver`] trait. The production implementation drives Chromium
//! over CDP ([`chromium::ChromiumDriver`]); tests substitute a recording
//! mock. Handles returned by the driver are opaque to the pool.

pub mod chromium;

use async_trait::async_trait;
use std::time::Duration;

pub use chromium::ChromiumDriver;

/// Opaque handle to one isolated browser context and its default page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverContext(u64);

impl DriverContext {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "drv-{}", self.0)
    }
}

/// Errors the browser layer can produce, each with a distinct identity.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// Navigation to a URL failed (timeout, DNS, HTTP-level refusal).
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// A page script raised or returned something unserializable.
    #[error("script evaluation failed: {0}")]
    Script(String),

    /// The browser process or its connection is gone. Terminal for the
    /// request; the pool survives and removes the context.
    #[error("browser connection lost: {0}")]
    Crash(String),

    /// Any other protocol-level failure.
    #[error("browser protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crash(_))
    }
}

/// Options for launching the shared browser process.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Fixed remote-debugging port so the CDP endpoint stays stable.
    pub cdp_port: u16,
    /// X display to render on (e.g. `:99`), when running headful under Xvfb.
    pub display: Option<String>,
}

/// Options for opening an isolated context.
#[derive(Debug, Clone, Default)]
pub struct NewContextOptions {
    /// Upstream proxy URL routed through this context only.
    pub proxy: Option<String>,
    /// Previously checkpointed storage state to restore.
    pub storage_state: Option<serde_json::Value>,
}

/// How long navigation waits before being considered settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
    Commit,
}

/// What navigation produced.
#[derive(Debug, Clone)]
pub struct NavigationOutcome {
    /// URL after redirects.
    pub final_url: String,
    /// HTTP status of the main document, when observable.
    pub status: Option<u16>,
}

/// Screenshot encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotFormat {
    #[default]
    Png,
    Jpeg,
}

/// Screenshot capture options.
#[derive(Debug, Clone, Default)]
pub struct ScreenshotOptions {
    pub full_page: bool,
    pub format: ScreenshotFormat,
    pub quality: Option<u8>,
}

/// The capability set the pool consumes from the browser layer.
///
/// Implementations must be safe to call from concurrent tasks. Teardown
/// operations (`shutdown`, `close_context`) swallow internal errors; the
/// pool has nothing useful to do with them.
#[async_trait]
pub trait ContextDriver: Send + Sync {
    /// Start the single shared browser process. Fatal on failure.
    async fn launch(&self, opts: &LaunchOptions) -> Result<(), DriverError>;

    /// Close the browser and all of its contexts. Idempotent.
    async fn shutdown(&self);

    /// Open an isolated context (cookies, storage, proxy) with one page.
    async fn new_context(&self, opts: NewContextOptions) -> Result<DriverContext, DriverError>;

    /// Tear down a single context. Never fails.
    async fn close_context(&self, ctx: DriverContext);

    /// Navigate the context's page.
    async fn navigate(
        &self,
        ctx: DriverContext,
        url: &str,
        timeout: Duration,
        wait_until: WaitUntil,
    ) -> Result<NavigationOutcome, DriverError>;

    /// HTML snapshot of the current page.
    async fn content(&self, ctx: DriverContext) -> Result<String, DriverError>;

    /// Evaluate a script, returning its JSON value. The caller applies the
    /// timeout by racing this future against a timer.
    async fn evaluate(
        &self,
        ctx: DriverContext,
        script: &str,
    ) -> Result<serde_json::Value, DriverError>;

    /// Capture a screenshot of the context's page.
    async fn screenshot(
        &self,
        ctx: DriverContext,
        opts: &ScreenshotOptions,
    ) -> Result<Vec<u8>, DriverError>;

    /// Serializable storage snapshot used for persistent checkpointing.
    async fn storage_state(&self, ctx: DriverContext) -> Result<serde_json::Value, DriverError>;

    /// Stable WebSocket URL for out-of-band control of this context's page.
    /// Best-effort; `None` when the driver cannot provide one.
    async fn cdp_target_url(&self, ctx: DriverContext) -> Option<String>;

    /// WebSocket endpoint of the browser process itself.
    fn cdp_endpoint(&self) -> Option<String>;
}
