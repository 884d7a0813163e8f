use lex_harness::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager, CircuitState,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn fast_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        failure_threshold: 3,
        success_threshold: 2,
        call_timeout: Duration::from_secs(5),
        reset_timeout: Duration::from_millis(100),
    }
}

async fn fail(cb: &CircuitBreaker, times: u32) {
    for _ in 0..times {
        let _ = cb.execute(|| async { Err::<(), _>("upstream 500") }).await;
    }
}

async fn succeed(cb: &CircuitBreaker) -> Result<u32, CircuitBreakerError<String>> {
    cb.execute(|| async { Ok::<_, String>(7) }).await
}

#[derive(Debug, PartialEq)]
struct UpstreamFault {
    status: u16,
}

// ---------------------------------------------------------------------------
// Closed -> Open
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn starts_closed() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    assert_eq!(cb.state().await, CircuitState::Closed);
    assert!(cb.is_healthy().await);
}

#[tokio::test(start_paused = true)]
async fn one_fewer_than_threshold_stays_closed() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 2).await;
    assert_eq!(cb.state().await, CircuitState::Closed);
    assert_eq!(cb.stats().await.failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn threshold_failures_open() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;
    assert_eq!(cb.state().await, CircuitState::Open);
    assert!(!cb.is_healthy().await);

    let stats = cb.stats().await;
    assert_eq!(stats.total_failures, 3);
    assert!(stats.next_attempt_at.is_some());
    assert!(stats.last_failure_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn success_clears_failure_streak() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 2).await;
    succeed(&cb).await.unwrap();
    fail(&cb, 2).await;
    assert_eq!(cb.state().await, CircuitState::Closed);
    assert_eq!(cb.stats().await.failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn inner_error_passes_through_unchanged() {
    let cb = CircuitBreaker::new("get_docket", fast_config());
    let err = cb
        .execute(|| async { Err::<(), _>(UpstreamFault { status: 502 }) })
        .await
        .unwrap_err();
    assert!(matches!(err, CircuitBreakerError::Inner(UpstreamFault { status: 502 })));
    assert_eq!(cb.stats().await.total_failures, 1);
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn open_rejects_without_invoking_operation() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;

    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..5 {
        let calls = calls.clone();
        let result = cb
            .execute(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        match result {
            Err(CircuitBreakerError::Open { breaker, retry_after }) => {
                assert_eq!(breaker, "get_opinion");
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_millis(100));
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // rejected calls still count as requests
    assert_eq!(cb.stats().await.total_requests, 8);
}

#[tokio::test(start_paused = true)]
async fn cooldown_elapsed_moves_to_half_open_and_runs_trial_call() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;

    tokio::time::advance(Duration::from_millis(101)).await;

    assert_eq!(succeed(&cb).await.unwrap(), 7);
    // success_threshold is 2, so one trial call success is not enough
    assert_eq!(cb.state().await, CircuitState::HalfOpen);
    assert_eq!(cb.stats().await.success_count, 1);
}

// ---------------------------------------------------------------------------
// HalfOpen
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn half_open_closes_after_success_threshold() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;
    tokio::time::advance(Duration::from_millis(101)).await;

    succeed(&cb).await.unwrap();
    succeed(&cb).await.unwrap();

    let stats = cb.stats().await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.success_count, 0);
    assert_eq!(stats.next_attempt_at, None);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_immediately() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;
    tokio::time::advance(Duration::from_millis(101)).await;

    succeed(&cb).await.unwrap();
    fail(&cb, 1).await;

    let stats = cb.stats().await;
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.success_count, 0);

    let result = succeed(&cb).await;
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_one_trial_call_at_a_time() {
    let cb = CircuitBreaker::new("search_opinions", CircuitBreakerConfig {
        success_threshold: 1,
        ..fast_config()
    });
    fail(&cb, 3).await;
    tokio::time::advance(Duration::from_millis(101)).await;

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let trial = {
        let cb = cb.clone();
        tokio::spawn(async move {
            cb.execute(|| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok::<_, String>("trial call")
            })
            .await
        })
    };
    started_rx.await.unwrap();
    assert_eq!(cb.state().await, CircuitState::HalfOpen);

    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let second = cb
        .execute(|| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("second")
        })
        .await;
    assert!(matches!(second, Err(CircuitBreakerError::Open { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    release_tx.send(()).unwrap();
    assert_eq!(trial.await.unwrap().unwrap(), "trial call");
    assert_eq!(cb.state().await, CircuitState::Closed);
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_failure() {
    let cb = CircuitBreaker::new("get_cluster", CircuitBreakerConfig {
        call_timeout: Duration::from_millis(100),
        ..fast_config()
    });

    let err = cb
        .execute(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, String>(())
        })
        .await
        .unwrap_err();

    match err {
        CircuitBreakerError::Timeout { breaker, elapsed, limit } => {
            assert_eq!(breaker, "get_cluster");
            assert_eq!(limit, Duration::from_millis(100));
            assert!(elapsed >= limit);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    let stats = cb.stats().await;
    assert_eq!(stats.failure_count, 1);
    assert_eq!(stats.total_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_trip_breaker() {
    let cb = CircuitBreaker::new("get_cluster", CircuitBreakerConfig {
        call_timeout: Duration::from_millis(10),
        ..fast_config()
    });
    for _ in 0..3 {
        let _ = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, String>(())
            })
            .await;
    }
    assert_eq!(cb.state().await, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn outcome_admitted_before_reset_does_not_drive_transitions() {
    let cb = CircuitBreaker::new("get_docket", CircuitBreakerConfig {
        failure_threshold: 1,
        ..fast_config()
    });

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let slow = {
        let cb = cb.clone();
        tokio::spawn(async move {
            cb.execute(|| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Err::<(), _>("late failure")
            })
            .await
        })
    };
    started_rx.await.unwrap();
    cb.reset().await;
    release_tx.send(()).unwrap();
    assert!(slow.await.unwrap().is_err());

    let stats = cb.stats().await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.total_failures, 1);
}

// ---------------------------------------------------------------------------
// Reset / disabled / stats
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reset_from_open_closes_and_keeps_totals() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;
    cb.reset().await;

    let stats = cb.stats().await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.success_count, 0);
    assert_eq!(stats.next_attempt_at, None);
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.total_failures, 3);

    assert_eq!(succeed(&cb).await.unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn reset_from_half_open() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;
    tokio::time::advance(Duration::from_millis(101)).await;
    succeed(&cb).await.unwrap();
    assert_eq!(cb.state().await, CircuitState::HalfOpen);

    cb.reset().await;
    let stats = cb.stats().await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.success_count, 0);
}

#[tokio::test(start_paused = true)]
async fn disabled_breaker_runs_untracked() {
    let cb = CircuitBreaker::new("get_opinion", CircuitBreakerConfig {
        enabled: false,
        failure_threshold: 1,
        ..fast_config()
    });
    for _ in 0..5 {
        let err = cb.execute(|| async { Err::<(), _>("down") }).await.unwrap_err();
        assert!(matches!(err, CircuitBreakerError::Inner("down")));
    }
    let stats = cb.stats().await;
    assert!(!stats.enabled);
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.total_requests, 0);
    assert_eq!(stats.total_failures, 0);
    assert!(cb.is_healthy().await);
}

#[tokio::test(start_paused = true)]
async fn stats_reads_are_pure() {
    let cb = CircuitBreaker::new("get_opinion", fast_config());
    fail(&cb, 3).await;
    let first = cb.stats().await;
    let second = cb.stats().await;
    assert_eq!(first, second);
    assert_eq!(cb.state().await, CircuitState::Open);
    // uptime is wall-clock and derived on read
    assert!(first.uptime() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn scenario_trip_cool_down_recover() {
    let cb = CircuitBreaker::new("search_opinions", CircuitBreakerConfig {
        enabled: true,
        failure_threshold: 3,
        success_threshold: 1,
        call_timeout: Duration::from_secs(5),
        reset_timeout: Duration::from_millis(50),
    });

    fail(&cb, 3).await;
    assert_eq!(cb.state().await, CircuitState::Open);
    assert!(matches!(succeed(&cb).await, Err(CircuitBreakerError::Open { .. })));

    tokio::time::advance(Duration::from_millis(60)).await;
    assert_eq!(succeed(&cb).await.unwrap(), 7);
    assert_eq!(cb.state().await, CircuitState::Closed);
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn manager_returns_shared_breaker_and_first_config_wins() {
    let manager = CircuitBreakerManager::new();
    let a = manager.get_breaker("get_opinion", &fast_config());
    let b = manager.get_breaker("get_opinion", &CircuitBreakerConfig {
        failure_threshold: 99,
        ..fast_config()
    });

    assert_eq!(b.config().failure_threshold, 3);
    fail(&a, 3).await;
    assert_eq!(b.state().await, CircuitState::Open);
    assert_eq!(manager.names(), vec!["get_opinion".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn manager_isolates_breakers_by_name() {
    let manager = CircuitBreakerManager::new();
    let opinions = manager.get_breaker("get_opinion", &fast_config());
    let dockets = manager.get_breaker("get_docket", &fast_config());

    fail(&opinions, 3).await;
    assert_eq!(opinions.state().await, CircuitState::Open);
    assert_eq!(dockets.state().await, CircuitState::Closed);
    assert_eq!(manager.open_breakers().await, vec!["get_opinion".to_string()]);

    let all = manager.all_stats().await;
    assert_eq!(all.len(), 2);
    assert_eq!(all["get_opinion"].state, CircuitState::Open);
    assert_eq!(all["get_docket"].state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn manager_health_and_reset() {
    let manager = CircuitBreakerManager::new();
    assert!(manager.are_all_healthy().await);

    let cb = manager.get_breaker("lookup_citation", &fast_config());
    manager.get_breaker("list_courts", &fast_config());
    assert!(manager.are_all_healthy().await);

    fail(&cb, 3).await;
    assert!(!manager.are_all_healthy().await);

    manager.reset_all().await;
    assert!(manager.are_all_healthy().await);
    assert!(manager.open_breakers().await.is_empty());

    fail(&cb, 3).await;
    assert!(manager.reset("lookup_citation").await);
    assert!(!manager.reset("no_such_tool").await);
    assert!(manager.are_all_healthy().await);
}

#[tokio::test]
async fn manager_concurrent_first_reference_creates_one_breaker() {
    let manager = Arc::new(CircuitBreakerManager::new());
    let mut handles = Vec::new();
    for _ in 0..16 {
        let m = manager.clone();
        handles.push(tokio::spawn(async move {
            let cb = m.get_breaker("search_dockets", &fast_config());
            let _ = cb.execute(|| async { Ok::<_, String>(()) }).await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(manager.names().len(), 1);
    let stats = manager.all_stats().await;
    assert_eq!(stats["search_dockets"].total_requests, 16);
}
