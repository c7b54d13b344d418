//! Per-context domain rate limiting
//!
//! Each context remembers when it last hit each domain; the limiter answers
//! whether enough wall time has passed since. State is private to the
//! context, so the same domain may be hit concurrently from different
//! contexts. That is intentional: the policy keeps one context from looking
//! mechanical, not the pool collectively.

use std::time::{Duration, Instant};

use super::context::ContextSlot;

/// Per-context, per-domain last-request bookkeeping.
#[derive(Debug, Clone)]
pub struct DomainRateLimiter {
    default_delay: Duration,
}

impl DomainRateLimiter {
    #[must_use]
    pub fn new(default_delay_ms: u64) -> Self {
        Self {
            default_delay: Duration::from_millis(default_delay_ms),
        }
    }

    fn effective_delay(&self, delay_ms: Option<u64>) -> Duration {
        delay_ms.map_or(self.default_delay, Duration::from_millis)
    }

    /// Whether the context may hit `domain` now.
    ///
    /// True when no prior request to the domain is recorded, or when the
    /// elapsed time since the last one reaches the effective delay.
    #[must_use]
    pub fn can_request(&self, ctx: &ContextSlot, domain: &str, delay_ms: Option<u64>) -> bool {
        let delay = self.effective_delay(delay_ms);
        let state = ctx.state();
        match state.domain_last_request.get(domain) {
            Some(last) => last.elapsed() >= delay,
            None => true,
        }
    }

    /// Remaining wait before the context may hit `domain`, zero if ready.
    #[must_use]
    pub fn time_until_available(
        &self,
        ctx: &ContextSlot,
        domain: &str,
        delay_ms: Option<u64>,
    ) -> Duration {
        let delay = self.effective_delay(delay_ms);
        let state = ctx.state();
        match state.domain_last_request.get(domain) {
            Some(last) => delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Record a request to `domain` from this context.
    pub fn record_request(&self, ctx: &ContextSlot, domain: &str) {
        let now = Instant::now();
        let mut state = ctx.state();
        state.domain_last_request.insert(domain.to_string(), now);
        state.last_used_at = Some(now);
        state.total_requests += 1;
    }

    /// Record a failed request on this context.
    pub fn record_error(&self, ctx: &ContextSlot) {
        let mut state = ctx.state();
        state.error_count += 1;
        state.consecutive_errors += 1;
    }

    /// Record a successful request, resetting the consecutive-error streak.
    pub fn record_success(&self, ctx: &ContextSlot) {
        ctx.state().consecutive_errors = 0;
    }
}

/// Extract the network authority from a URL: lowercased host, with the
/// port appended when one is present.
#[must_use]
pub fn extract_domain(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url)
        && let Some(host) = parsed.host_str()
    {
        return match parsed.port() {
            Some(port) => format!("{}:{port}", host.to_ascii_lowercase()),
            None => host.to_ascii_lowercase(),
        };
    }

    // Not an absolute URL; take everything up to the first path separator.
    let after_scheme = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}
