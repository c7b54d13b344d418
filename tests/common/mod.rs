//! Shared test fixtures
//!
//! A recording mock driver plus a pool constructor wired to it. Every
//! driver call is recorded so scenarios can assert on the exact sequence;
//! responses are configured per test.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use scrapepool::{
    ContextDriver, DriverContext, DriverError, LaunchOptions, NavigationOutcome,
    NewContextOptions, PoolSettings, ScraperPool, ScreenshotOptions, WaitUntil,
};

/// Recording mock of the browser layer.
#[derive(Default)]
pub struct MockDriver {
    launched: AtomicBool,
    next_handle: AtomicU64,
    calls: Mutex<Vec<String>>,
    open: Mutex<HashSet<u64>>,

    /// Navigation fails with a navigation error.
    pub fail_navigation: AtomicBool,
    /// Navigation fails with a crash error.
    pub crash_navigation: AtomicBool,
    /// Context creation fails with a crash error.
    pub crash_new_context: AtomicBool,
    /// Script evaluation fails with a script error.
    pub fail_script: AtomicBool,
    /// Artificial latency for navigate, to hold contexts busy.
    pub navigate_delay: Mutex<Option<Duration>>,
    /// Value returned by evaluate.
    pub script_result: Mutex<serde_json::Value>,
    /// Value returned by storage_state.
    pub storage: Mutex<serde_json::Value>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        let driver = Self::default();
        *driver.script_result.lock() = serde_json::json!(null);
        *driver.storage.lock() = serde_json::json!({ "cookies": [] });
        Arc::new(driver)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of calls whose label starts with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Number of contexts currently open on the driver side.
    pub fn open_contexts(&self) -> usize {
        self.open.lock().len()
    }
}

#[async_trait]
impl ContextDriver for MockDriver {
    async fn launch(&self, opts: &LaunchOptions) -> Result<(), DriverError> {
        self.record(format!("launch:headless={}", opts.headless));
        self.launched.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        self.record("shutdown");
        self.launched.store(false, Ordering::SeqCst);
        self.open.lock().clear();
    }

    async fn new_context(&self, opts: NewContextOptions) -> Result<DriverContext, DriverError> {
        self.record(format!(
            "new_context:proxy={},restore={}",
            opts.proxy.as_deref().unwrap_or("-"),
            opts.storage_state.is_some(),
        ));
        if self.crash_new_context.load(Ordering::SeqCst) {
            return Err(DriverError::Crash("target closed".into()));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.open.lock().insert(handle);
        Ok(DriverContext::new(handle))
    }

    async fn close_context(&self, ctx: DriverContext) {
        self.record(format!("close_context:{}", ctx.raw()));
        self.open.lock().remove(&ctx.raw());
    }

    async fn navigate(
        &self,
        _ctx: DriverContext,
        url: &str,
        _timeout: Duration,
        _wait_until: WaitUntil,
    ) -> Result<NavigationOutcome, DriverError> {
        self.record(format!("navigate:{url}"));
        let delay = *self.navigate_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.crash_navigation.load(Ordering::SeqCst) {
            return Err(DriverError::Crash("browser closed".into()));
        }
        if self.fail_navigation.load(Ordering::SeqCst) {
            return Err(DriverError::Navigation(
                "net::ERR_CONNECTION_REFUSED".into(),
            ));
        }
        Ok(NavigationOutcome {
            final_url: url.to_string(),
            status: Some(200),
        })
    }

    async fn content(&self, ctx: DriverContext) -> Result<String, DriverError> {
        self.record(format!("content:{}", ctx.raw()));
        Ok("<html><body>mock</body></html>".to_string())
    }

    async fn evaluate(
        &self,
        ctx: DriverContext,
        _script: &str,
    ) -> Result<serde_json::Value, DriverError> {
        self.record(format!("evaluate:{}", ctx.raw()));
        if self.fail_script.load(Ordering::SeqCst) {
            return Err(DriverError::Script(
                "ReferenceError: x is not defined".into(),
            ));
        }
        Ok(self.script_result.lock().clone())
    }

    async fn screenshot(
        &self,
        ctx: DriverContext,
        _opts: &ScreenshotOptions,
    ) -> Result<Vec<u8>, DriverError> {
        self.record(format!("screenshot:{}", ctx.raw()));
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn storage_state(&self, ctx: DriverContext) -> Result<serde_json::Value, DriverError> {
        self.record(format!("storage_state:{}", ctx.raw()));
        Ok(self.storage.lock().clone())
    }

    async fn cdp_target_url(&self, ctx: DriverContext) -> Option<String> {
        Some(format!(
            "ws://127.0.0.1:9222/devtools/page/mock-{}",
            ctx.raw()
        ))
    }

    fn cdp_endpoint(&self) -> Option<String> {
        if self.launched.load(Ordering::SeqCst) {
            Some("ws://127.0.0.1:9222/devtools/browser/mock".to_string())
        } else {
            None
        }
    }
}

/// Settings tuned for fast tests.
pub fn test_settings(max_contexts: usize) -> PoolSettings {
    PoolSettings {
        max_contexts,
        default_domain_delay_ms: 1000,
        max_queue_wait_seconds: 1,
        max_consecutive_errors: 5,
        persistent_contexts_path: std::env::temp_dir().join("scrapepool-tests"),
        ..PoolSettings::default()
    }
}

/// Started pool backed by a fresh mock driver.
pub async fn started_pool(settings: PoolSettings) -> (Arc<ScraperPool>, Arc<MockDriver>) {
    let driver = MockDriver::new();
    let pool = ScraperPool::new(settings, driver.clone());
    pool.start().await.expect("pool start");
    (pool, driver)
}
