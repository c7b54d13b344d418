//! Service configuration
//!
//! All runtime knobs are loaded once at startup from `SCRAPEPOOL_*`
//! environment variables, with defaults suitable for local development.
//! The resulting [`PoolSettings`] is immutable for the process lifetime.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix for every settings key.
const ENV_PREFIX: &str = "SCRAPEPOOL_";

/// Immutable pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum number of browser contexts kept in the pool.
    pub max_contexts: usize,

    /// Default delay between two requests from the same context to the
    /// same domain, in milliseconds. Per-request overrides are allowed.
    pub default_domain_delay_ms: u64,

    /// How long a scrape request may wait in the queue for a context
    /// before it is rejected with a timeout.
    pub max_queue_wait_seconds: u64,

    /// Consecutive-error threshold after which a context is recreated.
    pub max_consecutive_errors: u32,

    /// Eviction score weight for idle time (seconds).
    pub eviction_idle_weight: f64,
    /// Eviction score weight for the error rate (scaled by 100).
    pub eviction_error_weight: f64,
    /// Eviction score weight for context age (seconds).
    pub eviction_age_weight: f64,

    /// Fixed remote-debugging port the browser is launched with. External
    /// tools (captcha solvers) connect here over CDP.
    pub cdp_port: u16,

    /// Run the browser headless.
    pub browser_headless: bool,

    /// Boot an Xvfb virtual display when running headful.
    pub use_virtual_display: bool,

    /// Virtual display size as (width, height).
    pub virtual_display_size: (u32, u32),

    /// Root directory for persistent context storage. One subdirectory per
    /// persistent context id, each holding a single `state.json`.
    pub persistent_contexts_path: PathBuf,

    /// Address the HTTP control surface binds to.
    pub bind_addr: SocketAddr,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_contexts: 3,
            default_domain_delay_ms: 1000,
            max_queue_wait_seconds: 30,
            max_consecutive_errors: 5,
            eviction_idle_weight: 1.0,
            eviction_error_weight: 2.0,
            eviction_age_weight: 0.1,
            cdp_port: 9222,
            browser_headless: true,
            use_virtual_display: false,
            virtual_display_size: (1920, 1080),
            persistent_contexts_path: PathBuf::from("./data/contexts"),
            bind_addr: "127.0.0.1:8089".parse().expect("valid default bind addr"),
        }
    }
}

impl PoolSettings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// Malformed values are ignored with a warning rather than aborting
    /// startup; the default for that key is used instead.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_contexts: env_parse("MAX_CONTEXTS", defaults.max_contexts),
            default_domain_delay_ms: env_parse(
                "DEFAULT_DOMAIN_DELAY_MS",
                defaults.default_domain_delay_ms,
            ),
            max_queue_wait_seconds: env_parse(
                "MAX_QUEUE_WAIT_SECONDS",
                defaults.max_queue_wait_seconds,
            ),
            max_consecutive_errors: env_parse(
                "MAX_CONSECUTIVE_ERRORS",
                defaults.max_consecutive_errors,
            ),
            eviction_idle_weight: env_parse("EVICTION_IDLE_WEIGHT", defaults.eviction_idle_weight),
            eviction_error_weight: env_parse(
                "EVICTION_ERROR_WEIGHT",
                defaults.eviction_error_weight,
            ),
            eviction_age_weight: env_parse("EVICTION_AGE_WEIGHT", defaults.eviction_age_weight),
            cdp_port: env_parse("CDP_PORT", defaults.cdp_port),
            browser_headless: env_parse("BROWSER_HEADLESS", defaults.browser_headless),
            use_virtual_display: env_parse("USE_VIRTUAL_DISPLAY", defaults.use_virtual_display),
            virtual_display_size: env_var("VIRTUAL_DISPLAY_SIZE")
                .and_then(|raw| parse_display_size(&raw))
                .unwrap_or(defaults.virtual_display_size),
            persistent_contexts_path: env_var("PERSISTENT_CONTEXTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.persistent_contexts_path),
            bind_addr: env_parse("BIND_ADDR", defaults.bind_addr),
        }
    }

    /// Queue wait limit as a [`Duration`].
    #[must_use]
    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_secs(self.max_queue_wait_seconds)
    }

    /// Eviction weights bundled for the scorer.
    #[must_use]
    pub fn eviction_weights(&self) -> crate::pool::eviction::EvictionWeights {
        crate::pool::eviction::EvictionWeights {
            idle: self.eviction_idle_weight,
            error: self.eviction_error_weight,
            age: self.eviction_age_weight,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

/// Parse an env var, keeping the default (with a warning) on bad input.
fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env_var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparseable {ENV_PREFIX}{key}={raw:?}");
            default
        }),
        None => default,
    }
}

/// Parse a `WIDTHxHEIGHT` display size such as `1920x1080`.
fn parse_display_size(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_contexts, 3);
        assert_eq!(settings.default_domain_delay_ms, 1000);
        assert_eq!(settings.max_queue_wait(), Duration::from_secs(30));
        assert!(settings.browser_headless);
    }

    #[test]
    fn display_size_parsing() {
        assert_eq!(parse_display_size("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_display_size("800X600"), Some((800, 600)));
        assert_eq!(parse_display_size(" 1280 x 720 "), Some((1280, 720)));
        assert_eq!(parse_display_size("garbage"), None);
        assert_eq!(parse_display_size("1920"), None);
    }

    #[test]
    fn eviction_weights_bundle() {
        let settings = PoolSettings::default();
        let weights = settings.eviction_weights();
        assert!((weights.idle - 1.0).abs() < f64::EPSILON);
        assert!((weights.error - 2.0).abs() < f64::EPSILON);
        assert!((weights.age - 0.1).abs() < f64::EPSILON);
    }
}
