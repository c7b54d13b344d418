//! Context pool supervisor
//!
//! The data structures and coordination protocols that decide which browser
//! context serves which request: the registry of live contexts, per-context
//! domain rate limiting, eviction scoring, the waiter queue for saturated
//! pools, and the supervisor owning the browser lifecycle.

pub mod context;
pub mod display;
pub mod eviction;
pub mod queue;
pub mod rate_limiter;
pub mod registry;
pub mod supervisor;

pub use context::{ContextInfo, ContextSlot, PROTECTED_TAG, proxy_tag};
pub use eviction::{EvictionWeights, eviction_score, find_eviction_candidate, should_recreate};
pub use queue::{QueueTicket, QueuedRequest, RequestQueue};
pub use rate_limiter::{DomainRateLimiter, extract_domain};
pub use registry::{ContextRegistry, STATE_FILE};
pub use supervisor::ScraperPool;
