mod common;

use axum::http::StatusCode;
use common::{TestAppOptions, read_json, test_app};
use uuid::Uuid;

#[tokio::test]
async fn register_login_refresh_flow() {
    let app = test_app(TestAppOptions::default());

    let response = app
        .request(
            "POST",
            "/auth/register",
            None,
            Some(serde_json::json!({
                "email": "alice@example.com",
                "username": "alice",
                "password": "a long enough password",
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let registered = read_json(response).await;
    let refresh_token = registered["refresh_token"].as_str().unwrap().to_string();

    // Duplicate email conflicts with a stable machine code.
    let response = app
        .request(
            "POST",
            "/auth/register",
            None,
            Some(serde_json::json!({
                "email": "alice@example.com",
                "username": "someone-else",
                "password": "a long enough password",
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let conflict = read_json(response).await;
    assert_eq!(conflict["error"]["code"], "EMAIL_ALREADY_EXISTS");

    // Bad credentials answer 401.
    let response = app
        .request(
            "POST",
            "/auth/login",
            None,
            Some(serde_json::json!({
                "email": "alice@example.com",
                "password": "wrong password",
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        read_json(response).await["error"]["code"],
        "INVALID_CREDENTIALS"
    );

    let response = app
        .request(
            "POST",
            "/auth/login",
            None,
            Some(serde_json::json!({
                "email": "alice@example.com",
                "password": "a long enough password",
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Refresh rotates; the old token then revokes its family.
    let response = app
        .request(
            "POST",
            "/auth/refresh",
            None,
            Some(serde_json::json!({"refresh_token": refresh_token})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = read_json(response).await;
    assert_ne!(rotated["refresh_token"].as_str().unwrap(), refresh_token);

    let response = app
        .request(
            "POST",
            "/auth/refresh",
            None,
            Some(serde_json::json!({"refresh_token": refresh_token})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn conversation_and_message_flow_over_http() {
    let app = test_app(TestAppOptions::default());
    let (_alice_id, alice) = app.register("alice").await;
    let (bob_id, bob) = app.register("bob").await;

    let conv = app.direct_conversation(&alice, bob_id).await;

    // Creating the same direct pair again returns the same conversation.
    let response = app
        .request(
            "POST",
            "/chat/conversations",
            Some(&bob),
            Some(serde_json::json!({"kind": "direct", "other_user": _alice_id})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        read_json(response).await["id"].as_str().unwrap(),
        conv.to_string()
    );

    let response = app
        .request(
            "POST",
            "/chat/messages",
            Some(&alice),
            Some(serde_json::json!({"conversation_id": conv, "content": "hi bob"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let message = read_json(response).await;
    assert_eq!(message["content"], "hi bob");
    let message_id = message["id"].as_str().unwrap().to_string();

    let response = app
        .request(
            "GET",
            &format!("/chat/conversations/{}/messages", conv),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = read_json(response).await;
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["content"], "hi bob");

    // Bob's list shows the unread message.
    let response = app.request("GET", "/chat/conversations", Some(&bob), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let listed = read_json(response).await;
    assert_eq!(listed[0]["unread_count"], 1);
    assert_eq!(listed[0]["last_message"]["content"], "hi bob");

    // Reading clears the unread count.
    let response = app
        .request(
            "POST",
            &format!("/chat/messages/{}/read", message_id),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app.request("GET", "/chat/conversations", Some(&bob), None).await;
    assert_eq!(read_json(response).await[0]["unread_count"], 0);
}

#[tokio::test]
async fn non_member_reads_answer_404() {
    let app = test_app(TestAppOptions::default());
    let (_, alice) = app.register("alice").await;
    let (bob_id, _) = app.register("bob").await;
    let (_, eve) = app.register("eve").await;

    let conv = app.direct_conversation(&alice, bob_id).await;

    // Eve is not a member: both read and send answer 404, not 403.
    let response = app
        .request(
            "GET",
            &format!("/chat/conversations/{}/messages", conv),
            Some(&eve),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        read_json(response).await["error"]["code"],
        "CONVERSATION_NOT_FOUND"
    );

    let response = app
        .request(
            "POST",
            "/chat/messages",
            Some(&eve),
            Some(serde_json::json!({"conversation_id": conv, "content": "let me in"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_or_garbage_tokens_answer_401() {
    let app = test_app(TestAppOptions::default());
    let response = app.request("GET", "/chat/conversations", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request("GET", "/chat/conversations", Some("garbage"), None)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn weight_update_validates_the_sum() {
    let app = test_app(TestAppOptions::default());
    let (_, token) = app.register("alice").await;

    // {0.7, 0.2} with current {geo 0.1, recency 0.1} sums to 1.1.
    let response = app
        .request(
            "PUT",
            "/discovery/weights",
            Some(&token),
            Some(serde_json::json!({"semantic": 0.7, "interest": 0.2})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["error"]["code"], "VALIDATION_FAILED");

    // {0.7, 0.1} brings it back to 1.0.
    let response = app
        .request(
            "PUT",
            "/discovery/weights",
            Some(&token),
            Some(serde_json::json!({"semantic": 0.7, "interest": 0.1})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let updated = read_json(response).await;
    assert_eq!(updated["semantic"], 0.7);

    // Reset restores defaults.
    let response = app
        .request("POST", "/discovery/weights/reset", Some(&token), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["semantic"], 0.6);
}

#[tokio::test]
async fn rank_endpoint_scores_candidates() {
    let app = test_app(TestAppOptions::default());
    let (_, token) = app.register("alice").await;

    let strong = Uuid::new_v4();
    let weak = Uuid::new_v4();
    let response = app
        .request(
            "POST",
            "/discovery/rank",
            Some(&token),
            Some(serde_json::json!({
                "interest_bits": [255],
                "location": {"lat": 40.0, "lng": -74.0},
                "candidates": [
                    {
                        "user": weak,
                        "semantic_sim": 0.1,
                        "interest_bits": [0],
                    },
                    {
                        "user": strong,
                        "semantic_sim": 0.8,
                        "interest_bits": [255],
                        "location": {"lat": 40.0, "lng": -74.0},
                        "last_seen": chrono::Utc::now(),
                    },
                ],
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ranked = read_json(response).await;
    assert_eq!(ranked[0]["user"].as_str().unwrap(), strong.to_string());
    // Defaults: 0.6*0.8 + 0.2*1 + 0.1*1 + 0.1*1 = 0.78
    let score = ranked[0]["score"].as_f64().unwrap();
    assert!((score - 0.78).abs() < 1e-9, "got {}", score);
}

#[tokio::test]
async fn global_rate_limit_answers_429() {
    let app = test_app(TestAppOptions {
        per_minute: 3,
        ..TestAppOptions::default()
    });

    for _ in 0..3 {
        let response = app.request("GET", "/chat/conversations", None, None).await;
        // 401 (no token) but not rate limited yet.
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = app.request("GET", "/chat/conversations", None, None).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert!(body["error"]["retry_after"].as_u64().is_some());

    // Health endpoints are exempt from the limiter.
    let response = app.request("GET", "/health/live", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn readiness_follows_supervisor_state() {
    let app = test_app(TestAppOptions::default());

    let response = app.request("GET", "/health/live", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.request("GET", "/health/ready", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.request("GET", "/health/detailed", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);

    // After shutdown the service is neither ready nor live, and the
    // readiness gate turns API traffic away.
    app.supervisor.shutdown().await.unwrap();
    let response = app.request("GET", "/health/ready", None, None).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let response = app.request("GET", "/health/live", None, None).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let response = app.request("GET", "/chat/conversations", None, None).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn validation_errors_answer_400() {
    let app = test_app(TestAppOptions::default());
    let (_, alice) = app.register("alice").await;
    let (bob_id, _) = app.register("bob").await;
    let conv = app.direct_conversation(&alice, bob_id).await;

    let response = app
        .request(
            "POST",
            "/chat/messages",
            Some(&alice),
            Some(serde_json::json!({"conversation_id": conv, "content": ""})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            "GET",
            &format!("/chat/conversations/{}/messages?limit=500", conv),
            Some(&alice),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn summary_requires_consent_and_calls_the_model() {
    struct CannedSummarizer;

    #[async_trait::async_trait]
    impl tether::providers::Summarizer for CannedSummarizer {
        async fn summarize(
            &self,
            _conversation: uuid::Uuid,
            messages: &[tether::chat::Message],
        ) -> Result<String, tether::TetherError> {
            Ok(format!("{} message(s) about plans", messages.len()))
        }
    }

    let app = test_app(TestAppOptions {
        summarizer: Some(std::sync::Arc::new(CannedSummarizer)),
        ai_per_minute: 2,
        ..TestAppOptions::default()
    });
    let (alice_id, alice) = app.register("alice").await;
    let (bob_id, _) = app.register("bob").await;
    let conv = app.direct_conversation(&alice, bob_id).await;
    app.request(
        "POST",
        "/chat/messages",
        Some(&alice),
        Some(serde_json::json!({"conversation_id": conv, "content": "dinner friday?"})),
    )
    .await;

    // Without consent the endpoint refuses.
    let response = app
        .request(
            "POST",
            &format!("/chat/conversations/{}/summary", conv),
            Some(&alice),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.consent.grant(alice_id, tether::consent::CONSENT_AI_PROCESSING);
    let response = app
        .request(
            "POST",
            &format!("/chat/conversations/{}/summary", conv),
            Some(&alice),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_json(response).await["summary"],
        "1 message(s) about plans"
    );

    // The AI path has its own, stricter limit.
    let response = app
        .request(
            "POST",
            &format!("/chat/conversations/{}/summary", conv),
            Some(&alice),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
