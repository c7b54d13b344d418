pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod pool;
pub mod scrape;

pub use config::PoolSettings;
pub use driver::{
    ChromiumDriver, ContextDriver, DriverContext, DriverError, LaunchOptions, NavigationOutcome,
    NewContextOptions, ScreenshotFormat, ScreenshotOptions, WaitUntil,
};
pub use error::{PoolError, PoolResult};
pub use pool::{
    ContextInfo, ContextRegistry, ContextSlot, DomainRateLimiter, EvictionWeights, RequestQueue,
    ScraperPool, eviction_score, extract_domain, find_eviction_candidate, proxy_tag,
    should_recreate,
};
pub use scrape::{ScrapeOutcome, ScrapeRequest};
