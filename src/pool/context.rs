//! Pooled context metadata
//!
//! A [`ContextSlot`] pairs the opaque driver handle with everything the
//! pool tracks about one isolated browser session. Structural fields are
//! immutable after creation; hot fields live behind a per-context lock so
//! selection scans never serialize on a single global mutex.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

use crate::driver::DriverContext;

/// Tag that shields a context from eviction and replacement.
pub const PROTECTED_TAG: &str = "protected";

/// Reserved tag prefix the registry maintains for proxied contexts.
pub const PROXY_TAG_PREFIX: &str = "proxy:";

/// Build the auto-maintained proxy tag for a proxy URL.
#[must_use]
pub fn proxy_tag(proxy: &str) -> String {
    format!("{PROXY_TAG_PREFIX}{proxy}")
}

/// Mutable per-context state, guarded by the slot's own lock.
#[derive(Debug)]
pub struct ContextState {
    pub in_use: bool,
    /// Set when the consecutive-error threshold was crossed; the context is
    /// skipped by selection and eviction until its replacement lands.
    pub retiring: bool,
    pub tags: HashSet<String>,
    pub last_used_at: Option<Instant>,
    pub total_requests: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    /// Most recent request time per destination domain.
    pub domain_last_request: HashMap<String, Instant>,
}

/// One pooled browser context.
#[derive(Debug)]
pub struct ContextSlot {
    id: Uuid,
    driver: DriverContext,
    proxy: Option<String>,
    persistent: bool,
    storage_path: Option<PathBuf>,
    cdp_target_url: Option<String>,
    created_at: Instant,
    created_at_wall: DateTime<Utc>,
    state: Mutex<ContextState>,
}

impl ContextSlot {
    pub(crate) fn new(
        id: Uuid,
        driver: DriverContext,
        proxy: Option<String>,
        persistent: bool,
        storage_path: Option<PathBuf>,
        cdp_target_url: Option<String>,
        tags: HashSet<String>,
    ) -> Self {
        Self {
            id,
            driver,
            proxy,
            persistent,
            storage_path,
            cdp_target_url,
            created_at: Instant::now(),
            created_at_wall: Utc::now(),
            state: Mutex::new(ContextState {
                in_use: false,
                retiring: false,
                tags,
                last_used_at: None,
                total_requests: 0,
                error_count: 0,
                consecutive_errors: 0,
                domain_last_request: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn driver(&self) -> DriverContext {
        self.driver
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    #[must_use]
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    #[must_use]
    pub fn storage_path(&self) -> Option<&PathBuf> {
        self.storage_path.as_ref()
    }

    #[must_use]
    pub fn cdp_target_url(&self) -> Option<&str> {
        self.cdp_target_url.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Lock the mutable state. Guards must never be held across an await.
    pub fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock()
    }

    /// Current tag set, cloned.
    #[must_use]
    pub fn tags(&self) -> HashSet<String> {
        self.state.lock().tags.clone()
    }

    /// Health score used by selection: lower is healthier.
    #[must_use]
    pub fn health_score(&self) -> f64 {
        let state = self.state.lock();
        let error_rate = state.error_count as f64 / state.total_requests.max(1) as f64;
        10.0 * f64::from(state.consecutive_errors) + 5.0 * error_rate
    }

    /// Snapshot for the control surface.
    #[must_use]
    pub fn info(&self) -> ContextInfo {
        let state = self.state.lock();
        let mut tags: Vec<String> = state.tags.iter().cloned().collect();
        tags.sort();
        ContextInfo {
            id: self.id,
            proxy: self.proxy.clone(),
            persistent: self.persistent,
            in_use: state.in_use,
            tags,
            created_at: self.created_at_wall,
            total_requests: state.total_requests,
            error_count: state.error_count,
            consecutive_errors: state.consecutive_errors,
            cdp_target_url: self.cdp_target_url.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_created_at(&mut self, age: std::time::Duration) {
        self.created_at -= age;
    }
}

/// Serializable projection of a context for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    pub id: Uuid,
    pub proxy: Option<String>,
    pub persistent: bool,
    pub in_use: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub total_requests: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub cdp_target_url: Option<String>,
}
