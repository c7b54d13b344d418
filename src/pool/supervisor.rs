//! Pool supervisor
//!
//! Owns the one browser process, the context registry, the waiter queue,
//! and the background expiry sweep for the lifetime of the service. Start
//! and stop are idempotent; a launch failure mid-start tears down partial
//! state before the error propagates, so there is no observable
//! half-started pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PoolSettings;
use crate::driver::{ContextDriver, LaunchOptions};
use crate::error::PoolResult;

use super::display::VirtualDisplay;
use super::queue::RequestQueue;
use super::rate_limiter::DomainRateLimiter;
use super::registry::ContextRegistry;

/// Interval between queue expiry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The pool supervisor. Construct one per process in the application
/// bootstrap and pass it to every consumer.
pub struct ScraperPool {
    settings: PoolSettings,
    registry: ContextRegistry,
    queue: Arc<RequestQueue>,
    limiter: DomainRateLimiter,
    driver: Arc<dyn ContextDriver>,
    display: tokio::sync::Mutex<Option<VirtualDisplay>>,
    sweeper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ScraperPool {
    pub fn new(settings: PoolSettings, driver: Arc<dyn ContextDriver>) -> Arc<Self> {
        let registry = ContextRegistry::new(&settings, Arc::clone(&driver));
        let queue = Arc::new(RequestQueue::new(settings.max_queue_wait()));
        let limiter = DomainRateLimiter::new(settings.default_domain_delay_ms);
        Arc::new(Self {
            settings,
            registry,
            queue,
            limiter,
            driver,
            display: tokio::sync::Mutex::new(None),
            sweeper: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    #[must_use]
    pub fn limiter(&self) -> &DomainRateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn ContextDriver> {
        &self.driver
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stable WebSocket endpoint of the browser process.
    #[must_use]
    pub fn cdp_endpoint(&self) -> String {
        self.driver
            .cdp_endpoint()
            .unwrap_or_else(|| format!("ws://127.0.0.1:{}", self.settings.cdp_port))
    }

    /// Start the virtual display (when configured), launch the browser,
    /// and begin sweeping expired waiters. Idempotent.
    pub async fn start(self: &Arc<Self>) -> PoolResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.settings.use_virtual_display && !self.settings.browser_headless {
            match VirtualDisplay::start(self.settings.virtual_display_size) {
                Ok(display) => *self.display.lock().await = Some(display),
                Err(e) => warn!("Could not start virtual display, continuing without: {e}"),
            }
        }

        let display_name = self
            .display
            .lock()
            .await
            .as_ref()
            .map(|d| d.display().to_string());

        let launch = LaunchOptions {
            headless: self.settings.browser_headless,
            cdp_port: self.settings.cdp_port,
            display: display_name,
        };
        if let Err(e) = self.driver.launch(&launch).await {
            // No half-started state: unwind everything before propagating.
            self.started.store(false, Ordering::SeqCst);
            if let Some(mut display) = self.display.lock().await.take() {
                display.stop();
            }
            return Err(e.into());
        }

        self.registry.set_started(true);

        let pool = Arc::clone(self);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                if !pool.is_started() {
                    break;
                }
                let expired = pool.queue.cleanup_expired().await;
                if expired > 0 {
                    info!("Expired {expired} queued requests");
                }
                pool.dispatch_queue().await;
            }
        });
        *self.sweeper.lock().await = Some(sweeper);

        info!(
            "Pool started: max_contexts={}, headless={}, cdp_port={}",
            self.settings.max_contexts, self.settings.browser_headless, self.settings.cdp_port
        );
        Ok(())
    }

    /// Close every context, the browser, and the display. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }

        let rejected = self.queue.clear().await;
        if rejected > 0 {
            info!("Rejected {rejected} queued requests during shutdown");
        }

        self.registry.set_started(false);
        self.registry.remove_all().await;
        self.driver.shutdown().await;

        if let Some(mut display) = self.display.lock().await.take() {
            display.stop();
        }

        info!("Pool stopped");
    }
}
