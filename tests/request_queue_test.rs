//! Tests for the waiter queue: FIFO matching, one-shot completion slots,
//! and expiry behavior.

mod common;

use common::{started_pool, test_settings};
use scrapepool::{PoolError, RequestQueue};
use std::collections::HashSet;
use std::time::Duration;

fn tags(values: &[&str]) -> HashSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn enqueue_and_dequeue() {
    let queue = RequestQueue::new(Duration::from_secs(30));

    let ticket = queue
        .enqueue(tags(&["premium"]), "example.com".to_string(), None)
        .await;
    assert_eq!(queue.len().await, 1);

    assert!(queue.dequeue(ticket.id).await);
    assert!(queue.is_empty().await);

    // Dequeuing again is a no-op.
    assert!(!queue.dequeue(ticket.id).await);
}

#[tokio::test]
async fn find_match_requires_tag_subset() {
    let queue = RequestQueue::new(Duration::from_secs(30));

    let strict = queue
        .enqueue(tags(&["premium", "residential"]), String::new(), None)
        .await;
    let loose = queue.enqueue(tags(&["premium"]), String::new(), None).await;

    // A premium-only context cannot serve the stricter waiter, so the
    // later, looser waiter matches first.
    let matched = queue.find_match(&tags(&["premium"]), None).await;
    assert_eq!(matched, Some(loose.id));

    // A context with both tags serves the older waiter first (FIFO).
    let matched = queue
        .find_match(&tags(&["premium", "residential"]), None)
        .await;
    assert_eq!(matched, Some(strict.id));
}

#[tokio::test]
async fn find_match_honors_domain() {
    let queue = RequestQueue::new(Duration::from_secs(30));

    let ticket = queue
        .enqueue(HashSet::new(), "example.com".to_string(), None)
        .await;

    assert_eq!(
        queue.find_match(&HashSet::new(), Some("other.com")).await,
        None
    );
    assert_eq!(
        queue.find_match(&HashSet::new(), Some("example.com")).await,
        Some(ticket.id)
    );
    // No offered domain matches any waiter.
    assert_eq!(
        queue.find_match(&HashSet::new(), None).await,
        Some(ticket.id)
    );
}

#[tokio::test]
async fn completion_slot_fires_exactly_once() {
    let (pool, _driver) = started_pool(test_settings(2)).await;
    let ctx = pool
        .registry()
        .create_context(None, false, &[])
        .await
        .expect("create");

    let queue = RequestQueue::new(Duration::from_secs(30));
    let ticket = queue.enqueue(HashSet::new(), String::new(), None).await;
    let ctx_id = ctx.id();

    assert!(queue.resolve(ticket.id, ctx.clone()).await);
    // The waiter is gone; a second resolution or rejection is a no-op.
    assert!(!queue.resolve(ticket.id, ctx).await);
    assert!(
        !queue
            .reject(ticket.id, PoolError::QueueTimeout(Duration::from_secs(1)))
            .await
    );

    let received = ticket.slot.await.expect("slot fired").expect("resolved ok");
    assert_eq!(received.id(), ctx_id);
    assert!(queue.is_empty().await);

    pool.stop().await;
}

#[tokio::test]
async fn cleanup_expires_at_exact_deadline() {
    // Zero max wait: a freshly enqueued request is already at its
    // deadline and must expire, not survive it.
    let queue = RequestQueue::new(Duration::ZERO);
    let ticket = queue.enqueue(HashSet::new(), String::new(), None).await;

    assert_eq!(queue.cleanup_expired().await, 1);
    assert!(queue.is_empty().await);

    let err = ticket
        .slot
        .await
        .expect("slot fired")
        .expect_err("rejected with timeout");
    assert!(matches!(err, PoolError::QueueTimeout(_)));
}

#[tokio::test]
async fn cleanup_keeps_fresh_requests() {
    let queue = RequestQueue::new(Duration::from_secs(60));
    let _ticket = queue.enqueue(HashSet::new(), String::new(), None).await;

    assert_eq!(queue.cleanup_expired().await, 0);
    assert_eq!(queue.len().await, 1);
}

#[tokio::test]
async fn pending_count_filters_by_tags() {
    let queue = RequestQueue::new(Duration::from_secs(30));
    queue.enqueue(tags(&["premium"]), String::new(), None).await;
    queue
        .enqueue(tags(&["premium", "eu"]), String::new(), None)
        .await;
    queue.enqueue(tags(&["basic"]), String::new(), None).await;

    assert_eq!(queue.pending_count(None).await, 3);
    assert_eq!(queue.pending_count(Some(&tags(&["premium"]))).await, 2);
    assert_eq!(queue.pending_count(Some(&tags(&["basic"]))).await, 1);
}

#[tokio::test]
async fn clear_rejects_everything() {
    let queue = RequestQueue::new(Duration::from_secs(30));
    let ticket = queue.enqueue(HashSet::new(), String::new(), None).await;

    assert_eq!(queue.clear().await, 1);
    let err = ticket.slot.await.expect("slot fired").expect_err("rejected");
    assert!(matches!(err, PoolError::NotStarted));
}
