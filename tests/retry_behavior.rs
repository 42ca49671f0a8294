//! Retry engine against a real (mock) HTTP endpoint.

use std::time::Duration;

use tether::TetherError;
use tether::retry::{Retrier, RetryConfig};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(max_retries: u32, base_ms: u64, jitter: bool) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_secs(1),
        jitter,
        ..RetryConfig::default()
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<String, TetherError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| TetherError::transient(e.to_string(), None))?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(TetherError::transient(
            format!("status {}", status),
            Some(status),
        ));
    }
    response
        .text()
        .await
        .map_err(|e| TetherError::transient(e.to_string(), None))
}

#[tokio::test]
async fn two_503s_then_200_succeeds_on_the_third_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered payload"))
        .expect(1)
        .mount(&server)
        .await;

    let retrier = Retrier::new(config(3, 10, false));
    let client = reqwest::Client::new();
    let cancel = CancellationToken::new();
    let url = server.uri();

    let started = std::time::Instant::now();
    let body = retrier
        .run(&cancel, |_| fetch(&client, &url))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // The 200's body propagates untouched.
    assert_eq!(body, "recovered payload");

    let stats = retrier.stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.retries, 2);
    // Backoff 10ms + 20ms with jitter off.
    assert_eq!(stats.total_delay_ms, 30);
    assert!(elapsed >= Duration::from_millis(30), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn persistent_503_exhausts_and_reports_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let retrier = Retrier::new(config(3, 5, false));
    let client = reqwest::Client::new();
    let url = server.uri();
    let err = retrier
        .run(&CancellationToken::new(), |_| fetch(&client, &url))
        .await
        .unwrap_err();

    match err {
        TetherError::Transient { message, status } => {
            assert!(message.contains("4 attempts"), "got: {}", message);
            assert_eq!(status, Some(503));
        }
        other => panic!("expected Transient, got {:?}", other),
    }
    assert_eq!(retrier.stats().failures, 1);
}

#[tokio::test]
async fn status_400_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let retrier = Retrier::new(config(5, 5, false));
    let client = reqwest::Client::new();
    let url = server.uri();
    let err = retrier
        .run(&CancellationToken::new(), |_| fetch(&client, &url))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Transient { status: Some(400), .. }));
    assert_eq!(retrier.stats().attempts, 1);
}

#[tokio::test]
async fn connection_refused_is_retried_as_transport_error() {
    // Nothing listens on this port.
    let retrier = Retrier::new(config(2, 5, false));
    let client = reqwest::Client::new();
    let err = retrier
        .run(&CancellationToken::new(), |_| {
            fetch(&client, "http://127.0.0.1:9/")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Transient { .. }));
    assert_eq!(retrier.stats().attempts, 3);
}

#[tokio::test]
async fn jitter_stays_within_ten_percent() {
    let retrier = Retrier::new(config(1, 100, true));
    let started = std::time::Instant::now();
    let _ = retrier
        .run(&CancellationToken::new(), |attempt| async move {
            if attempt == 1 {
                Err::<(), _>(TetherError::transient("first try fails", None))
            } else {
                Ok(())
            }
        })
        .await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "elapsed {:?}", elapsed);
    // 100ms base + at most 10ms noise, plus generous scheduling slack.
    assert!(elapsed < Duration::from_millis(200), "elapsed {:?}", elapsed);
}
