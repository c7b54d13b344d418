//! Scrape coordinator
//!
//! Drives one scrape end to end: pick a context (or make room for one, or
//! wait for one), acquire it, navigate and capture, record the outcome,
//! release, and kick off background recreation when a context has failed
//! too many times in a row.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::driver::{DriverError, ScreenshotFormat, ScreenshotOptions};
use crate::error::{PoolError, PoolResult};
use crate::pool::context::ContextSlot;
use crate::pool::eviction::should_recreate;
use crate::pool::rate_limiter::extract_domain;
use crate::pool::supervisor::ScraperPool;

use super::{ScrapeOutcome, ScrapeRequest};

impl ScraperPool {
    /// Execute one scrape request.
    ///
    /// Returns `Err` only for failures that never reached the page: pool
    /// not started, queue timeout, acquisition races, and browser crashes.
    /// Page-level failures (navigation, capture) come back as an
    /// unsuccessful [`ScrapeOutcome`] with the error recorded against the
    /// serving context.
    pub async fn scrape(self: &Arc<Self>, request: ScrapeRequest) -> PoolResult<ScrapeOutcome> {
        if !self.is_started() {
            return Err(PoolError::NotStarted);
        }

        let selection_tags: HashSet<String> = request.tags.iter().cloned().collect();
        let domain = extract_domain(&request.url);
        let queue_start = Instant::now();
        let mut queue_wait = Duration::ZERO;

        // Selection matches caller tags only; creation tags get the proxy
        // tag added by the registry. A caller asking for "residential" is
        // happy with any residential context, whatever proxy it wears.
        let selected = self
            .registry()
            .select_context(
                (!selection_tags.is_empty()).then_some(&selection_tags),
                Some(&domain),
                request.domain_delay_ms,
                self.limiter(),
            )
            .await;

        let ctx = match selected {
            Some(ctx) => ctx,
            None => {
                match self
                    .registry()
                    .evict_and_replace(&request.tags, request.proxy.clone(), false)
                    .await?
                {
                    Some(ctx) => ctx,
                    None => {
                        self.wait_for_context(&selection_tags, &domain, &request)
                            .await
                            .map(|ctx| {
                                queue_wait = queue_start.elapsed();
                                ctx
                            })?
                    }
                }
            }
        };

        let ctx = self.registry().acquire_context(ctx.id()).await?;

        let drive = self.drive(&ctx, &request, &domain).await;

        // FINALIZE: the context always goes back into rotation, then the
        // error streak may trigger its replacement.
        self.registry().release_context(ctx.id()).await;

        if should_recreate(&ctx, self.settings().max_consecutive_errors)
            && self.registry().mark_retiring(ctx.id()).await
        {
            debug!(
                "Context {} crossed the consecutive-error threshold, scheduling recreation",
                ctx.id()
            );
            let pool = Arc::clone(self);
            let id = ctx.id();
            tokio::spawn(async move {
                match pool.registry().recreate_context(id).await {
                    Ok(Some(fresh)) => pool.offer_to_queue(&fresh).await,
                    Ok(None) => {}
                    Err(e) => warn!("Background recreation of context {id} failed: {e}"),
                }
            });
        }

        match drive {
            Ok(mut outcome) => {
                self.offer_to_queue(&ctx).await;
                outcome.queue_wait = queue_wait;
                Ok(outcome)
            }
            Err(err) => {
                // The browser-side context is gone; drop our half too.
                if err.is_driver_crash() {
                    match self.registry().remove_context(ctx.id()).await {
                        Ok(_) => {}
                        Err(e) => warn!("Could not remove crashed context {}: {e}", ctx.id()),
                    }
                }
                Err(err)
            }
        }
    }

    /// Park in the queue until a context frees up or the wait expires.
    async fn wait_for_context(
        &self,
        selection_tags: &HashSet<String>,
        domain: &str,
        request: &ScrapeRequest,
    ) -> PoolResult<Arc<ContextSlot>> {
        let max_wait = self.settings().max_queue_wait();
        let ticket = self
            .queue()
            .enqueue(
                selection_tags.clone(),
                domain.to_string(),
                request.domain_delay_ms,
            )
            .await;
        debug!("Scrape of {} queued as {}", request.url, ticket.id);

        match tokio::time::timeout(max_wait, ticket.slot).await {
            Ok(Ok(Ok(ctx))) => Ok(ctx),
            Ok(Ok(Err(err))) => Err(err),
            // Slot dropped or timer fired: leave no orphaned waiter behind.
            Ok(Err(_)) | Err(_) => {
                self.queue().dequeue(ticket.id).await;
                Err(PoolError::QueueTimeout(max_wait))
            }
        }
    }

    /// DRIVE phase: navigate and capture on an acquired context.
    async fn drive(
        &self,
        ctx: &Arc<ContextSlot>,
        request: &ScrapeRequest,
        domain: &str,
    ) -> PoolResult<ScrapeOutcome> {
        let driver = self.driver();
        let timeout = request.timeout();

        self.limiter().record_request(ctx, domain);

        let nav = match driver
            .navigate(ctx.driver(), &request.url, timeout, request.wait_until)
            .await
        {
            Ok(nav) => nav,
            Err(e) => return self.drive_failed(ctx, request, e),
        };

        let mut content = None;
        if request.get_content {
            match driver.content(ctx.driver()).await {
                Ok(html) => content = Some(html),
                Err(e) => return self.drive_failed(ctx, request, e),
            }
        }

        // Script problems are recoverable: the scrape still succeeds with a
        // null script result.
        let mut script_result = None;
        if let Some(ref script) = request.script {
            match tokio::time::timeout(timeout, driver.evaluate(ctx.driver(), script)).await {
                Ok(Ok(value)) => script_result = Some(value),
                Ok(Err(e)) if e.is_crash() => return self.drive_failed(ctx, request, e),
                Ok(Err(e)) => {
                    warn!("Script execution failed for context {}: {e}", ctx.id());
                }
                Err(_) => {
                    warn!(
                        "Script evaluation timed out after {}ms for context {}",
                        timeout.as_millis(),
                        ctx.id()
                    );
                }
            }
        }

        let mut screenshot = None;
        if request.screenshot {
            let opts = ScreenshotOptions {
                full_page: request.screenshot_full_page,
                format: ScreenshotFormat::Png,
                quality: None,
            };
            match driver.screenshot(ctx.driver(), &opts).await {
                Ok(bytes) => screenshot = Some(bytes),
                Err(e) => return self.drive_failed(ctx, request, e),
            }
        }

        self.limiter().record_success(ctx);

        Ok(ScrapeOutcome {
            success: true,
            url: nav.final_url,
            status: nav.status,
            content,
            script_result,
            screenshot,
            context_id: ctx.id(),
            queue_wait: Duration::ZERO,
            error: None,
        })
    }

    /// Record a drive failure. Crashes propagate as errors; anything else
    /// becomes an unsuccessful outcome.
    fn drive_failed(
        &self,
        ctx: &Arc<ContextSlot>,
        request: &ScrapeRequest,
        err: DriverError,
    ) -> PoolResult<ScrapeOutcome> {
        self.limiter().record_error(ctx);
        if err.is_crash() {
            return Err(err.into());
        }
        warn!("Scrape failed for context {}: {err}", ctx.id());
        Ok(ScrapeOutcome::failed(
            request.url.clone(),
            ctx.id(),
            err.to_string(),
        ))
    }

    /// Serve queued waiters whose requirements a context now satisfies.
    /// Run periodically so waiters blocked only on a rate-limit delay are
    /// picked up once the delay elapses.
    pub(crate) async fn dispatch_queue(&self) {
        for waiter in self.queue().pending().await {
            let required = (!waiter.tags.is_empty()).then_some(&waiter.tags);
            let domain = (!waiter.domain.is_empty()).then_some(waiter.domain.as_str());
            if let Some(ctx) = self
                .registry()
                .select_context(required, domain, waiter.domain_delay_ms, self.limiter())
                .await
            {
                self.queue().resolve(waiter.id, ctx).await;
            }
        }
    }

    /// Offer a free context to the first queued waiter it can serve.
    pub(crate) async fn offer_to_queue(&self, ctx: &Arc<ContextSlot>) {
        {
            let state = ctx.state();
            if state.in_use || state.retiring {
                return;
            }
        }
        let limiter = self.limiter();
        let handed_off = self
            .queue()
            .offer(ctx, |waiter| {
                waiter.domain.is_empty()
                    || limiter.can_request(ctx, &waiter.domain, waiter.domain_delay_ms)
            })
            .await;
        if handed_off {
            debug!("Context {} handed to a queued waiter", ctx.id());
        }
    }
}
