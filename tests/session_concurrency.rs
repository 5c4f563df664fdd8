//! Concurrency and lifecycle tests for the session manager, driven through
//! the deterministic mock backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use htmlshot::mock::MockBackend;
use htmlshot::{EngineConfig, Error, RenderRequest, SessionManager};

fn fast_config() -> EngineConfig {
    EngineConfig {
        settle_delay_ms: 0,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fifty_concurrent_renders_launch_the_process_once() {
    let backend = MockBackend::new();
    // Widen the race window so every task arrives before the launch lands.
    backend.delay_launch(Duration::from_millis(100));
    let manager = Arc::new(SessionManager::new(fast_config(), backend.factory()));

    let tasks = (0..50).map(|i| {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .render(RenderRequest::new(format!("<h1>poster {i}</h1>"), 800, 600))
                .await
        })
    });

    for task in futures::future::join_all(tasks).await {
        let result = task.expect("render task panicked").expect("render failed");
        assert_eq!((result.width, result.height), (800, 600));
    }

    assert_eq!(backend.launches(), 1, "process must start exactly once");
    assert_eq!(backend.live_surfaces(), 0, "every lease must be released");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_callers_observe_the_same_launch_failure() {
    let backend = MockBackend::new();
    backend.fail_next_launches(1);
    backend.delay_launch(Duration::from_millis(200));
    let manager = Arc::new(SessionManager::new(fast_config(), backend.factory()));

    let tasks = (0..20).map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ensure_started().await })
    });

    for task in futures::future::join_all(tasks).await {
        let outcome = task.expect("task panicked");
        assert!(
            matches!(outcome, Err(Error::EngineLaunchFailed(_))),
            "every waiter of the failed attempt gets the same error, got {outcome:?}"
        );
    }
    assert_eq!(backend.launches(), 1, "the failed attempt launched once");

    // The failure rolled the state back; a later call retries and succeeds.
    backend.delay_launch(Duration::ZERO);
    manager.ensure_started().await.expect("retry should succeed");
    assert_eq!(backend.launches(), 2);
}

#[tokio::test]
async fn leases_are_conserved_on_every_failure_path() {
    let backend = MockBackend::new();
    let manager = SessionManager::new(fast_config(), backend.factory());
    let request = RenderRequest::new("<p>doc</p>", 800, 600);

    // Success path
    manager.render(request.clone()).await.unwrap();
    assert_eq!(backend.live_surfaces(), 0);

    // Content-load failure
    backend.fail_content_load(true);
    let err = manager.render(request.clone()).await.unwrap_err();
    assert!(matches!(err, Error::RenderFailed(_)));
    assert_eq!(backend.live_surfaces(), 0);
    backend.fail_content_load(false);

    // Forced crash at capture time
    backend.crash_on_capture(true);
    let err = manager.render(request.clone()).await.unwrap_err();
    assert!(matches!(err, Error::RenderFailed(_)));
    assert_eq!(backend.live_surfaces(), 0);
    backend.crash_on_capture(false);

    manager.render(request).await.unwrap();
    assert_eq!(backend.live_surfaces(), 0);
}

#[tokio::test]
async fn dropped_lease_is_disposed_in_the_background() {
    let backend = MockBackend::new();
    let manager = SessionManager::new(fast_config(), backend.factory());

    let lease = manager.acquire_page().await.unwrap();
    assert_eq!(backend.live_surfaces(), 1);
    drop(lease);

    // Disposal happens on a background thread; give it a moment.
    for _ in 0..50 {
        if backend.live_surfaces() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("leaked surface was never disposed");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_bounded_when_the_process_never_closes() {
    let backend = MockBackend::new();
    backend.hang_on_close(Duration::from_millis(1500));
    let config = EngineConfig {
        shutdown_step_timeout_ms: 200,
        ..fast_config()
    };
    let manager = SessionManager::new(config, backend.factory());
    manager.ensure_started().await.unwrap();

    let start = Instant::now();
    let report = manager.shutdown().await;
    let elapsed = start.elapsed();

    assert_eq!(report.steps_run, 2);
    assert_eq!(report.steps_timed_out, 1);
    assert!(
        elapsed < Duration::from_millis(1000),
        "shutdown must return within roughly two step bounds, took {elapsed:?}"
    );

    // State reset to stopped: a fresh start works.
    backend.hang_on_close(Duration::ZERO);
    manager.ensure_started().await.unwrap();
    assert_eq!(backend.launches(), 2);
}

#[tokio::test]
async fn lease_cap_is_enforced_with_a_timeout() {
    let backend = MockBackend::new();
    let config = EngineConfig {
        max_pages: 2,
        lease_timeout_ms: 100,
        ..fast_config()
    };
    let manager = SessionManager::new(config, backend.factory());

    let first = manager.acquire_page().await.unwrap();
    let second = manager.acquire_page().await.unwrap();

    let err = manager.acquire_page().await.unwrap_err();
    assert!(matches!(err, Error::LeaseTimeout(100)));

    manager.release_page(first).await;
    let third = manager.acquire_page().await.unwrap();

    manager.release_page(second).await;
    manager.release_page(third).await;
    assert_eq!(backend.live_surfaces(), 0);
}
