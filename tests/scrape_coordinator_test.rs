//! End-to-end coordinator scenarios against the recording mock driver.

mod common;

use common::{started_pool, test_settings};
use scrapepool::{PoolError, ScrapeRequest, proxy_tag};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn scrape_on_empty_pool_creates_context() {
    let (pool, driver) = started_pool(test_settings(2)).await;

    let outcome = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect("scrape");

    assert!(outcome.success);
    assert_eq!(outcome.url, "https://example.com");
    assert_eq!(outcome.status, Some(200));
    assert!(outcome.content.is_some());
    assert_eq!(outcome.queue_wait, Duration::ZERO);
    assert_eq!(pool.registry().size().await, 1);
    assert_eq!(driver.call_count("new_context"), 1);
    assert_eq!(driver.call_count("navigate"), 1);
    let calls = driver.calls();
    assert!(calls.first().is_some_and(|c| c.starts_with("launch")));

    // The context went back into rotation.
    let ctx = pool
        .registry()
        .get_context(outcome.context_id)
        .await
        .expect("context lives");
    assert!(!ctx.state().in_use);

    pool.stop().await;
}

#[tokio::test]
async fn scrape_reuses_tagged_context() {
    let (pool, driver) = started_pool(test_settings(3)).await;
    let premium = pool
        .registry()
        .create_context(None, false, &["premium".to_string()])
        .await
        .expect("premium");
    let basic = pool
        .registry()
        .create_context(None, false, &["basic".to_string()])
        .await
        .expect("basic");

    let mut request = ScrapeRequest::for_url("https://example.com");
    request.tags = vec!["premium".to_string()];
    let outcome = pool.scrape(request).await.expect("scrape");

    assert!(outcome.success);
    assert_eq!(outcome.context_id, premium.id());
    // The basic context was untouched.
    assert_eq!(basic.state().total_requests, 0);
    assert_eq!(driver.call_count("new_context"), 2);

    pool.stop().await;
}

#[tokio::test]
async fn scrape_at_capacity_evicts_and_replaces() {
    let (pool, _driver) = started_pool(test_settings(2)).await;
    pool.registry()
        .create_context(None, false, &["basic".to_string()])
        .await
        .expect("a");
    pool.registry()
        .create_context(None, false, &["basic".to_string()])
        .await
        .expect("b");

    let mut request = ScrapeRequest::for_url("https://example.com");
    request.tags = vec!["residential".to_string()];
    request.proxy = Some("http://p".to_string());
    let outcome = pool.scrape(request).await.expect("scrape");

    assert!(outcome.success);
    assert_eq!(pool.registry().size().await, 2);
    let ctx = pool
        .registry()
        .get_context(outcome.context_id)
        .await
        .expect("fresh context");
    let tags = ctx.tags();
    assert!(tags.contains("residential"));
    assert!(tags.contains(&proxy_tag("http://p")));

    pool.stop().await;
}

#[tokio::test]
async fn scrape_waits_in_queue_until_release() {
    let mut settings = test_settings(1);
    settings.max_queue_wait_seconds = 5;
    let (pool, driver) = started_pool(settings).await;

    // First scrape holds the only context for a while.
    *driver.navigate_delay.lock() = Some(Duration::from_millis(300));
    let first = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.scrape(ScrapeRequest::for_url("https://slow.example.com"))
                .await
        })
    };
    // Let the first scrape acquire the context.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.registry().available_count().await, 0);

    // Second scrape targets another domain so the rate limiter does not
    // get in the way; it must queue, then resume on release.
    *driver.navigate_delay.lock() = None;
    let outcome = pool
        .scrape(ScrapeRequest::for_url("https://other.example.com"))
        .await
        .expect("queued scrape");

    assert!(outcome.success);
    assert!(outcome.queue_wait > Duration::ZERO);
    first.await.expect("join").expect("first scrape");
    assert_eq!(pool.registry().size().await, 1);

    pool.stop().await;
}

#[tokio::test]
async fn scrape_times_out_when_nothing_frees_up() {
    let mut settings = test_settings(1);
    settings.max_queue_wait_seconds = 1;
    let (pool, driver) = started_pool(settings).await;

    // Hold the only context longer than the queue allows.
    *driver.navigate_delay.lock() = Some(Duration::from_millis(2500));
    let first = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.scrape(ScrapeRequest::for_url("https://slow.example.com"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = pool
        .scrape(ScrapeRequest::for_url("https://other.example.com"))
        .await
        .expect_err("queue timeout");
    assert!(matches!(err, PoolError::QueueTimeout(_)));
    // No orphaned waiter stays behind.
    assert!(pool.queue().is_empty().await);

    first.await.expect("join").expect("first scrape");
    pool.stop().await;
}

#[tokio::test]
async fn navigation_failure_is_recorded_not_fatal() {
    let (pool, driver) = started_pool(test_settings(2)).await;
    driver.fail_navigation.store(true, Ordering::SeqCst);

    let outcome = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect("scrape returns an outcome");

    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap_or("").contains("navigation"));
    let ctx = pool
        .registry()
        .get_context(outcome.context_id)
        .await
        .expect("context survives");
    {
        let state = ctx.state();
        assert_eq!(state.error_count, 1);
        assert_eq!(state.consecutive_errors, 1);
        assert_eq!(state.total_requests, 1);
        assert!(!state.in_use);
    }

    pool.stop().await;
}

#[tokio::test]
async fn error_threshold_triggers_background_recreation() {
    let mut settings = test_settings(1);
    settings.max_consecutive_errors = 5;
    let (pool, driver) = started_pool(settings).await;

    let ctx = pool
        .registry()
        .create_context(None, false, &["sticky".to_string()])
        .await
        .expect("create");
    let old_id = ctx.id();
    ctx.state().consecutive_errors = 4;

    driver.fail_navigation.store(true, Ordering::SeqCst);
    let outcome = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect("outcome");
    assert!(!outcome.success);
    assert_eq!(outcome.context_id, old_id);
    assert_eq!(ctx.state().consecutive_errors, 5);

    // Recreation runs in the background after release.
    let mut replaced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if pool.registry().get_context(old_id).await.is_none() {
            replaced = true;
            break;
        }
    }
    assert!(replaced, "old context should be gone after recreation");
    assert_eq!(pool.registry().size().await, 1);

    let fresh = pool
        .registry()
        .list_contexts(None)
        .await
        .into_iter()
        .next()
        .expect("replacement exists");
    assert_ne!(fresh.id, old_id);
    assert!(fresh.tags.contains(&"sticky".to_string()));

    pool.stop().await;
}

#[tokio::test]
async fn driver_crash_fails_request_and_removes_context() {
    let (pool, driver) = started_pool(test_settings(2)).await;
    driver.crash_navigation.store(true, Ordering::SeqCst);

    let err = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect_err("crash is terminal");
    assert!(err.is_driver_crash());

    // The pool survives: the crashed context is gone, a later scrape
    // creates a fresh one.
    assert_eq!(pool.registry().size().await, 0);
    driver.crash_navigation.store(false, Ordering::SeqCst);
    let outcome = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect("recovered");
    assert!(outcome.success);

    pool.stop().await;
}

#[tokio::test]
async fn context_creation_crash_is_terminal() {
    let (pool, driver) = started_pool(test_settings(2)).await;
    driver.crash_new_context.store(true, Ordering::SeqCst);

    let err = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect_err("creation crash");
    assert!(err.is_driver_crash());
    assert_eq!(pool.registry().size().await, 0);

    pool.stop().await;
}

#[tokio::test]
async fn script_failure_does_not_fail_the_scrape() {
    let (pool, driver) = started_pool(test_settings(2)).await;
    driver.fail_script.store(true, Ordering::SeqCst);

    let mut request = ScrapeRequest::for_url("https://example.com");
    request.script = Some("document.title".to_string());
    let outcome = pool.scrape(request).await.expect("scrape");

    assert!(outcome.success);
    assert!(outcome.script_result.is_none());

    pool.stop().await;
}

#[tokio::test]
async fn script_result_is_carried_through() {
    let (pool, driver) = started_pool(test_settings(2)).await;
    *driver.script_result.lock() = serde_json::json!({ "title": "Example", "links": 3 });

    let mut request = ScrapeRequest::for_url("https://example.com");
    request.script = Some("({title: document.title, links: 3})".to_string());
    let outcome = pool.scrape(request).await.expect("scrape");

    assert!(outcome.success);
    assert_eq!(
        outcome.script_result,
        Some(serde_json::json!({ "title": "Example", "links": 3 }))
    );

    pool.stop().await;
}

#[tokio::test]
async fn screenshot_is_returned_raw() {
    let (pool, driver) = started_pool(test_settings(2)).await;

    let mut request = ScrapeRequest::for_url("https://example.com");
    request.screenshot = true;
    request.screenshot_full_page = true;
    let outcome = pool.scrape(request).await.expect("scrape");

    assert!(outcome.success);
    assert_eq!(outcome.screenshot, Some(vec![0x89, b'P', b'N', b'G']));
    assert_eq!(driver.call_count("screenshot"), 1);

    pool.stop().await;
}

#[tokio::test]
async fn scrape_before_start_is_rejected() {
    let driver = common::MockDriver::new();
    let pool = scrapepool::ScraperPool::new(test_settings(1), driver);

    let err = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect_err("not started");
    assert!(matches!(err, PoolError::NotStarted));
}

#[tokio::test]
async fn rate_limited_context_is_not_reused_immediately() {
    // One protected context (so eviction cannot sidestep the rate limit):
    // the second scrape to the same domain has to wait out the per-domain
    // delay before the dispatch pass hands it the context again.
    let mut settings = test_settings(1);
    settings.default_domain_delay_ms = 200;
    settings.max_queue_wait_seconds = 5;
    let (pool, _driver) = started_pool(settings).await;
    pool.registry()
        .create_context(None, false, &["protected".to_string()])
        .await
        .expect("create");

    let first = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect("first");
    assert!(first.success);

    let start = std::time::Instant::now();
    let second = pool
        .scrape(ScrapeRequest::for_url("https://example.com"))
        .await
        .expect("second");
    assert!(second.success);
    assert!(
        start.elapsed() >= Duration::from_millis(150),
        "second scrape should have waited for the domain delay"
    );

    pool.stop().await;
}
