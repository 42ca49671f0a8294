use super::*;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

fn no_jitter(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(80),
        jitter: false,
        ..RetryConfig::default()
    }
}

#[tokio::test]
async fn succeeds_first_attempt_without_delay() {
    let retrier = Retrier::new(no_jitter(3));
    let cancel = CancellationToken::new();

    let result = retrier
        .run(&cancel, |_| async { Ok::<_, TetherError>(42) })
        .await
        .unwrap();

    assert_eq!(result, 42);
    let stats = retrier.stats();
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.total_delay_ms, 0);
}

#[tokio::test]
async fn retries_transient_then_succeeds() {
    let retrier = Retrier::new(no_jitter(3));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let result = retrier
        .run(&cancel, move |_| {
            let calls = calls_in.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TetherError::transient("service unavailable", Some(503)))
                } else {
                    Ok("body")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, "body");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stats = retrier.stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.retries, 2);
    // 10ms + 20ms with jitter off.
    assert_eq!(stats.total_delay_ms, 30);
}

#[tokio::test]
async fn non_retryable_fails_immediately() {
    let retrier = Retrier::new(no_jitter(5));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let err = retrier
        .run(&cancel, move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TetherError::Authentication("bad token".into()))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TetherError::Authentication(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhaustion_wraps_attempt_count_and_elapsed() {
    let retrier = Retrier::new(no_jitter(2));
    let cancel = CancellationToken::new();

    let err = retrier
        .run(&cancel, |_| async {
            Err::<(), _>(TetherError::transient("connection reset", None))
        })
        .await
        .unwrap_err();

    match err {
        TetherError::Transient { message, .. } => {
            assert!(message.contains("3 attempts"), "got: {}", message);
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected Transient, got {:?}", other),
    }
    assert_eq!(retrier.stats().attempts, 3);
}

#[tokio::test]
async fn attempts_never_exceed_max_retries_plus_one() {
    let retrier = Retrier::new(no_jitter(4));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let _ = retrier
        .run(&cancel, move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TetherError::transient("reset", None))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn delays_double_up_to_cap() {
    let config = no_jitter(10);
    assert_eq!(config.delay_for(1), Duration::from_millis(10));
    assert_eq!(config.delay_for(2), Duration::from_millis(20));
    assert_eq!(config.delay_for(3), Duration::from_millis(40));
    assert_eq!(config.delay_for(4), Duration::from_millis(80));
    // Capped at max_delay from here on.
    assert_eq!(config.delay_for(5), Duration::from_millis(80));
    assert_eq!(config.delay_for(9), Duration::from_millis(80));
}

#[test]
fn default_profile_excludes_429() {
    let retrier = Retrier::default();
    assert!(!retrier.should_retry(&TetherError::RateLimited { retry_after: None }));
    assert!(retrier.should_retry(&TetherError::transient("", Some(502))));
    assert!(!retrier.should_retry(&TetherError::transient("", Some(400))));
}

#[test]
fn aggressive_profile_retries_429() {
    let retrier = Retrier::new(RetryConfig::aggressive());
    assert!(retrier.should_retry(&TetherError::RateLimited { retry_after: None }));
}

#[tokio::test]
async fn cancellation_during_backoff_returns_immediately() {
    let retrier = Retrier::new(RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(60),
        jitter: false,
        ..RetryConfig::default()
    });
    let cancel = CancellationToken::new();

    let cancel_in = cancel.clone();
    let err = retrier
        .run(&cancel, move |_| {
            let cancel = cancel_in.clone();
            async move {
                // Cancel while the retrier is about to sleep.
                cancel.cancel();
                Err::<(), _>(TetherError::transient("reset", None))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TetherError::Internal(_)));
    assert_eq!(retrier.stats().attempts, 1);
}
