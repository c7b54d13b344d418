//! Chromium implementation of the context driver
//!
//! Drives one shared Chromium process over CDP via chromiumoxide. Isolated
//! contexts map to `Target.createBrowserContext` browser contexts, each with
//! a single page. Storage checkpoints are cookie snapshots taken with
//! `Storage.getCookies` and restored with `Storage.setCookies`.

use anyhow::Context as _;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use chromiumoxide::cdp::browser_protocol::storage::{GetCookiesParams, SetCookiesParams};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::page::Page;
use dashmap::DashMap;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use super::{
    ContextDriver, DriverContext, DriverError, LaunchOptions, NavigationOutcome,
    NewContextOptions, ScreenshotFormat, ScreenshotOptions, WaitUntil,
};

/// User agent presented by every pooled context.
const CHROME_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// How long to wait for the main-document response event after navigation.
const STATUS_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

struct BrowserState {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

struct ContextEntry {
    context_id: BrowserContextId,
    page: Page,
}

/// chromiumoxide-backed [`ContextDriver`].
pub struct ChromiumDriver {
    state: tokio::sync::Mutex<Option<BrowserState>>,
    contexts: DashMap<u64, ContextEntry>,
    next_handle: AtomicU64,
    cdp_port: AtomicU64,
    endpoint: parking_lot::Mutex<Option<String>>,
}

impl Default for ChromiumDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ChromiumDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(None),
            contexts: DashMap::new(),
            next_handle: AtomicU64::new(1),
            cdp_port: AtomicU64::new(0),
            endpoint: parking_lot::Mutex::new(None),
        }
    }

    fn entry(&self, ctx: DriverContext) -> Result<(BrowserContextId, Page), DriverError> {
        self.contexts
            .get(&ctx.raw())
            .map(|e| (e.context_id.clone(), e.page.clone()))
            .ok_or_else(|| DriverError::Crash(format!("unknown context handle {ctx}")))
    }
}

#[async_trait]
impl ContextDriver for ChromiumDriver {
    async fn launch(&self, opts: &LaunchOptions) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let (browser, handler, user_data_dir) = launch_browser(opts)
            .await
            .map_err(|e| DriverError::Crash(format!("{e:#}")))?;

        self.cdp_port
            .store(u64::from(opts.cdp_port), Ordering::Relaxed);
        *self.endpoint.lock() = Some(browser.websocket_address().to_string());

        *state = Some(BrowserState {
            browser,
            handler,
            user_data_dir: Some(user_data_dir),
        });
        Ok(())
    }

    async fn shutdown(&self) {
        let Some(mut taken) = self.state.lock().await.take() else {
            return;
        };
        self.contexts.clear();
        *self.endpoint.lock() = None;

        if let Err(e) = taken.browser.close().await {
            warn!("Failed to close browser: {e}");
        }
        if let Err(e) = taken.browser.wait().await {
            warn!("Failed to wait for browser exit: {e}");
        }
        taken.handler.abort();

        if let Some(dir) = taken.user_data_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("Failed to remove user data dir {}: {e}", dir.display());
            }
        }
    }

    async fn new_context(&self, opts: NewContextOptions) -> Result<DriverContext, DriverError> {
        let state = self.state.lock().await;
        let Some(state) = state.as_ref() else {
            return Err(DriverError::Crash("browser not launched".into()));
        };

        let mut params = CreateBrowserContextParams::default();
        params.proxy_server = opts.proxy;
        let created = state
            .browser
            .execute(params)
            .await
            .map_err(classify_cdp_error)?;
        let context_id = created.browser_context_id.clone();

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(context_id.clone());
        let page = match state.browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                // Context without a page is useless; dispose before bailing.
                let _ = state
                    .browser
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await;
                return Err(classify_cdp_error(e));
            }
        };

        if let Some(ref snapshot) = opts.storage_state {
            if let Err(e) = restore_cookies(&state.browser, &context_id, snapshot).await {
                warn!("Failed to restore storage state: {e}");
            }
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.contexts.insert(handle, ContextEntry { context_id, page });
        debug!("Opened browser context drv-{handle}");
        Ok(DriverContext::new(handle))
    }

    async fn close_context(&self, ctx: DriverContext) {
        let Some((_, entry)) = self.contexts.remove(&ctx.raw()) else {
            return;
        };
        let state = self.state.lock().await;
        if let Some(state) = state.as_ref() {
            if let Err(e) = state
                .browser
                .execute(DisposeBrowserContextParams::new(entry.context_id))
                .await
            {
                debug!("Error disposing browser context {ctx}: {e}");
            }
        }
    }

    async fn navigate(
        &self,
        ctx: DriverContext,
        url: &str,
        timeout: Duration,
        wait_until: WaitUntil,
    ) -> Result<NavigationOutcome, DriverError> {
        let (_, page) = self.entry(ctx)?;

        // The listener must exist before navigation or the document
        // response can be missed entirely.
        let mut responses = match page.event_listener::<EventResponseReceived>().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                trace!("No response listener for {url}: {e}");
                None
            }
        };

        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(navigation_error(e)),
            Err(_) => {
                return Err(DriverError::Navigation(format!(
                    "navigation to {url} timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        }

        if matches!(wait_until, WaitUntil::Load | WaitUntil::NetworkIdle) {
            match tokio::time::timeout(timeout, page.wait_for_navigation()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(navigation_error(e)),
                Err(_) => {
                    return Err(DriverError::Navigation(format!(
                        "page load for {url} timed out after {}ms",
                        timeout.as_millis()
                    )));
                }
            }
        }

        let final_url = match page.url().await {
            Ok(Some(current)) => current,
            _ => url.to_string(),
        };

        // Best-effort HTTP status from the buffered document response.
        let mut status = None;
        if let Some(ref mut stream) = responses {
            let deadline = tokio::time::Instant::now() + STATUS_EVENT_TIMEOUT;
            while let Ok(Some(event)) =
                tokio::time::timeout_at(deadline, stream.next()).await
            {
                if event.r#type == ResourceType::Document {
                    status = u16::try_from(event.response.status).ok();
                    break;
                }
            }
        }

        Ok(NavigationOutcome { final_url, status })
    }

    async fn content(&self, ctx: DriverContext) -> Result<String, DriverError> {
        let (_, page) = self.entry(ctx)?;
        page.content().await.map_err(classify_cdp_error)
    }

    async fn evaluate(
        &self,
        ctx: DriverContext,
        script: &str,
    ) -> Result<serde_json::Value, DriverError> {
        let (_, page) = self.entry(ctx)?;
        let result = page
            .evaluate(script)
            .await
            .map_err(|e| match classify_cdp_error(e) {
                DriverError::Crash(msg) => DriverError::Crash(msg),
                other => DriverError::Script(other.to_string()),
            })?;
        result
            .into_value::<serde_json::Value>()
            .map_err(|e| DriverError::Script(format!("unserializable script result: {e}")))
    }

    async fn screenshot(
        &self,
        ctx: DriverContext,
        opts: &ScreenshotOptions,
    ) -> Result<Vec<u8>, DriverError> {
        let (_, page) = self.entry(ctx)?;
        let params = CaptureScreenshotParams {
            format: Some(match opts.format {
                ScreenshotFormat::Png => CaptureScreenshotFormat::Png,
                ScreenshotFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            }),
            quality: opts.quality.map(i64::from),
            capture_beyond_viewport: Some(opts.full_page),
            ..Default::default()
        };
        page.screenshot(params).await.map_err(classify_cdp_error)
    }

    async fn storage_state(&self, ctx: DriverContext) -> Result<serde_json::Value, DriverError> {
        let (context_id, _) = self.entry(ctx)?;
        let state = self.state.lock().await;
        let Some(state) = state.as_ref() else {
            return Err(DriverError::Crash("browser not launched".into()));
        };

        let mut params = GetCookiesParams::default();
        params.browser_context_id = Some(context_id);
        let snapshot = state
            .browser
            .execute(params)
            .await
            .map_err(classify_cdp_error)?;
        let cookies = serde_json::to_value(&snapshot.cookies)
            .map_err(|e| DriverError::Protocol(format!("cookie serialization failed: {e}")))?;
        Ok(serde_json::json!({ "cookies": cookies }))
    }

    async fn cdp_target_url(&self, ctx: DriverContext) -> Option<String> {
        let (_, page) = self.entry(ctx).ok()?;
        let port = self.cdp_port.load(Ordering::Relaxed);
        if port == 0 {
            return None;
        }
        Some(format!(
            "ws://127.0.0.1:{port}/devtools/page/{}",
            page.target_id().inner()
        ))
    }

    fn cdp_endpoint(&self) -> Option<String> {
        self.endpoint.lock().clone()
    }
}

/// Map a chromiumoxide error to a driver error kind.
///
/// Connection-level failures (the browser process or its websocket going
/// away) are crashes; everything else is a protocol error.
fn classify_cdp_error(e: CdpError) -> DriverError {
    let msg = e.to_string();
    let lowered = msg.to_lowercase();
    if lowered.contains("target closed")
        || lowered.contains("browser closed")
        || lowered.contains("connection closed")
        || lowered.contains("channel")
        || lowered.contains("websocket")
    {
        DriverError::Crash(msg)
    } else {
        DriverError::Protocol(msg)
    }
}

fn navigation_error(e: CdpError) -> DriverError {
    match classify_cdp_error(e) {
        DriverError::Crash(msg) => DriverError::Crash(msg),
        other => DriverError::Navigation(other.to_string()),
    }
}

/// Restore a cookie snapshot into a freshly created context.
async fn restore_cookies(
    browser: &Browser,
    context_id: &BrowserContextId,
    snapshot: &serde_json::Value,
) -> Result<(), DriverError> {
    let Some(raw) = snapshot.get("cookies") else {
        return Ok(());
    };
    let cookies: Vec<CookieParam> = serde_json::from_value(raw.clone())
        .map_err(|e| DriverError::Protocol(format!("invalid cookie snapshot: {e}")))?;
    if cookies.is_empty() {
        return Ok(());
    }
    let mut params = SetCookiesParams::new(cookies);
    params.browser_context_id = Some(context_id.clone());
    browser
        .execute(params)
        .await
        .map_err(classify_cdp_error)?;
    Ok(())
}

/// Find a Chrome/Chromium executable on the system.
pub async fn find_browser_executable() -> anyhow::Result<PathBuf> {
    // Environment variable overrides all other methods
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Found browser at: {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            let output = Command::new("which").arg(cmd).output();
            if let Ok(output) = output
                && output.status.success()
            {
                let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path_str.is_empty() {
                    let path = PathBuf::from(path_str);
                    info!("Found browser using 'which': {}", path.display());
                    return Ok(path);
                }
            }
        }
    }

    warn!("No Chrome/Chromium executable found. Will download and use fetcher.");
    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Download a managed Chromium when none is installed locally.
pub async fn download_managed_browser() -> anyhow::Result<PathBuf> {
    info!("Downloading managed Chromium browser...");

    let cache_dir = std::env::temp_dir().join("scrapepool_chromium");
    std::fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("Failed to build fetcher options")?,
    );

    let revision_info = fetcher.fetch().await.context("Failed to fetch browser")?;
    info!(
        "Downloaded Chromium to: {}",
        revision_info.folder_path.display()
    );
    Ok(revision_info.executable_path)
}

/// Launch the shared browser with a fixed debugging port.
async fn launch_browser(
    opts: &LaunchOptions,
) -> anyhow::Result<(Browser, JoinHandle<()>, PathBuf)> {
    let chrome_path = match find_browser_executable().await {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };

    let user_data_dir =
        std::env::temp_dir().join(format!("scrapepool_chrome_{}", std::process::id()));
    std::fs::create_dir_all(&user_data_dir).context("Failed to create user data directory")?;

    let mut config_builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(user_data_dir.clone())
        .chrome_executable(chrome_path);

    if opts.headless {
        config_builder = config_builder.headless_mode(HeadlessMode::default());
    } else {
        config_builder = config_builder.with_head();
    }

    if let Some(ref display) = opts.display {
        config_builder = config_builder.arg(format!("--display={display}"));
    }

    config_builder = config_builder
        .arg(format!("--remote-debugging-port={}", opts.cdp_port))
        .arg(format!("--user-agent={CHROME_USER_AGENT}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--disable-software-rasterizer")
        .arg("--disable-setuid-sandbox")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--ignore-certificate-errors")
        .arg("--disable-extensions")
        .arg("--disable-popup-blocking")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-ipc-flooding-protection")
        .arg("--disable-prompt-on-repost")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--hide-scrollbars")
        .arg("--mute-audio");

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    info!("Launching browser on CDP port {}", opts.cdp_port);
    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("Failed to launch browser")?;

    let handler_task = task::spawn(async move {
        while let Some(h) = handler.next().await {
            if let Err(e) = h {
                let error_msg = e.to_string();

                // Chrome emits CDP events chromiumoxide doesn't recognize;
                // those deserialization failures are benign.
                let is_benign_serialization_error = error_msg
                    .contains("data did not match any variant of untagged enum Message")
                    || error_msg.contains("Failed to deserialize WS response");

                if is_benign_serialization_error {
                    trace!("Suppressed benign CDP serialization error: {error_msg}");
                } else {
                    error!("Browser handler error: {e:?}");
                }
            }
        }
        info!("Browser handler task completed");
    });

    Ok((browser, handler_task, user_data_dir))
}
