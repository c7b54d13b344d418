//! Request queue for saturated pools
//!
//! When no context can serve a scrape, the coordinator parks a waiter here.
//! Each waiter carries a one-shot completion slot that resolves exactly once
//! to a context or a failure. Scans are FIFO by arrival; there is no
//! cross-call fairness guarantee (a later waiter with looser tags can win a
//! context an earlier, stricter waiter cannot use).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::PoolError;

use super::context::ContextSlot;

type CompletionSlot = oneshot::Sender<Result<Arc<ContextSlot>, PoolError>>;

/// A waiter parked in the queue.
pub struct QueuedRequest {
    pub id: Uuid,
    /// Tags the resolved context must carry (subset match).
    pub tags: HashSet<String>,
    /// Destination domain, empty when unknown.
    pub domain: String,
    /// Per-request rate-limit delay override.
    pub domain_delay_ms: Option<u64>,
    pub enqueued_at: Instant,
    /// `None` once the slot has fired; it never fires twice.
    slot: Option<CompletionSlot>,
}

/// Requirements snapshot of one parked waiter.
#[derive(Debug, Clone)]
pub struct PendingWaiter {
    pub id: Uuid,
    pub tags: HashSet<String>,
    pub domain: String,
    pub domain_delay_ms: Option<u64>,
}

/// Handle returned to the waiter.
pub struct QueueTicket {
    pub id: Uuid,
    pub enqueued_at: Instant,
    pub slot: oneshot::Receiver<Result<Arc<ContextSlot>, PoolError>>,
}

/// FIFO queue of waiters, serialized by a single lock.
pub struct RequestQueue {
    entries: tokio::sync::Mutex<Vec<QueuedRequest>>,
    max_wait: Duration,
}

impl RequestQueue {
    #[must_use]
    pub fn new(max_wait: Duration) -> Self {
        Self {
            entries: tokio::sync::Mutex::new(Vec::new()),
            max_wait,
        }
    }

    /// Park a new waiter and hand back its ticket.
    pub async fn enqueue(
        &self,
        tags: HashSet<String>,
        domain: String,
        domain_delay_ms: Option<u64>,
    ) -> QueueTicket {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let enqueued_at = Instant::now();

        self.entries.lock().await.push(QueuedRequest {
            id,
            tags,
            domain,
            domain_delay_ms,
            enqueued_at,
            slot: Some(tx),
        });
        debug!("Enqueued request {id}");

        QueueTicket {
            id,
            enqueued_at,
            slot: rx,
        }
    }

    /// Remove a waiter without resolving it (timeout or cancellation).
    pub async fn dequeue(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|r| r.id != id);
        entries.len() != before
    }

    /// Resolve a waiter with a context. Returns false if the waiter is gone
    /// or its slot already fired.
    pub async fn resolve(&self, id: Uuid, ctx: Arc<ContextSlot>) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(pos) = entries.iter().position(|r| r.id == id) else {
            return false;
        };
        let Some(slot) = entries[pos].slot.take() else {
            return false;
        };
        entries.remove(pos);
        slot.send(Ok(ctx)).is_ok()
    }

    /// Reject a waiter with an error. Same once-only contract as `resolve`.
    pub async fn reject(&self, id: Uuid, err: PoolError) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(pos) = entries.iter().position(|r| r.id == id) else {
            return false;
        };
        let Some(slot) = entries[pos].slot.take() else {
            return false;
        };
        entries.remove(pos);
        slot.send(Err(err)).is_ok()
    }

    /// First pending waiter a context with `available_tags` could serve.
    ///
    /// A waiter matches when its required tags are a subset of the offered
    /// tags and, if both sides name a domain, the domains agree.
    pub async fn find_match(
        &self,
        available_tags: &HashSet<String>,
        domain: Option<&str>,
    ) -> Option<Uuid> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|r| {
                r.tags.is_subset(available_tags)
                    && match (r.domain.as_str(), domain) {
                        ("", _) | (_, None) => true,
                        (wanted, Some(offered)) => wanted == offered,
                    }
            })
            .map(|r| r.id)
    }

    /// Offer a freed context to the first waiter it can serve.
    ///
    /// `ready` lets the caller layer the rate-limit check on top of the tag
    /// match. Returns true when a waiter was resolved.
    pub async fn offer<F>(&self, ctx: &Arc<ContextSlot>, ready: F) -> bool
    where
        F: Fn(&QueuedRequest) -> bool,
    {
        let available_tags = ctx.tags();
        let mut entries = self.entries.lock().await;
        let Some(pos) = entries
            .iter()
            .position(|r| r.tags.is_subset(&available_tags) && ready(r))
        else {
            return false;
        };
        let Some(slot) = entries[pos].slot.take() else {
            return false;
        };
        let waiter = entries.remove(pos);
        debug!("Handing context {} to queued request {}", ctx.id(), waiter.id);
        slot.send(Ok(Arc::clone(ctx))).is_ok()
    }

    /// Requirements of every parked waiter, FIFO, for dispatch passes.
    pub async fn pending(&self) -> Vec<PendingWaiter> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|r| PendingWaiter {
                id: r.id,
                tags: r.tags.clone(),
                domain: r.domain.clone(),
                domain_delay_ms: r.domain_delay_ms,
            })
            .collect()
    }

    /// Reject every waiter that has outlived the configured maximum wait.
    pub async fn cleanup_expired(&self) -> usize {
        let mut expired = 0;
        let mut entries = self.entries.lock().await;
        entries.retain_mut(|r| {
            if r.enqueued_at.elapsed() >= self.max_wait {
                if let Some(slot) = r.slot.take() {
                    let _ = slot.send(Err(PoolError::QueueTimeout(self.max_wait)));
                }
                expired += 1;
                debug!("Request {} expired in queue", r.id);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Reject everything, used during shutdown.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let drained = entries.len();
        for mut entry in entries.drain(..) {
            if let Some(slot) = entry.slot.take() {
                let _ = slot.send(Err(PoolError::NotStarted));
            }
        }
        drained
    }

    /// Number of parked waiters.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Count pending waiters, optionally only those requiring `tags`.
    pub async fn pending_count(&self, tags: Option<&HashSet<String>>) -> usize {
        let entries = self.entries.lock().await;
        match tags {
            None => entries.len(),
            Some(required) => entries
                .iter()
                .filter(|r| required.is_subset(&r.tags))
                .count(),
        }
    }
}
