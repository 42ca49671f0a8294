#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use tower::ServiceExt;
use uuid::Uuid;

use tether::auth::{AuthService, HmacTokenService, SqliteAccountStore};
use tether::chat::{ChatService, SqliteChatStore, UserId};
use tether::consent::InMemoryConsentOracle;
use tether::crypto::{FieldCipher, KeyRing};
use tether::gateway::{AppState, RateLimits, build_router};
use tether::health::{Supervisor, SupervisorConfig};
use tether::providers::Summarizer;
use tether::ranking::{InMemoryWeightStore, RankingEngine, WeightManager};
use tether::realtime::{RealtimeServer, SocketRegistry};

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub consent: Arc<InMemoryConsentOracle>,
    pub registry: Arc<SocketRegistry>,
    pub supervisor: Arc<Supervisor>,
}

pub struct TestAppOptions {
    pub per_minute: u32,
    pub ai_per_minute: u32,
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

impl Default for TestAppOptions {
    fn default() -> Self {
        Self {
            per_minute: 10_000,
            ai_per_minute: 10_000,
            summarizer: None,
        }
    }
}

pub fn test_app(options: TestAppOptions) -> TestApp {
    let store = Arc::new(SqliteChatStore::open_in_memory().unwrap());
    let cipher = Arc::new(FieldCipher::new(
        KeyRing::new(1, "integration test ring key").unwrap(),
        false,
    ));
    let chat = Arc::new(ChatService::new(store.clone(), cipher, 4096));

    let tokens = Arc::new(
        HmacTokenService::new("integration-test-secret", chrono::Duration::minutes(30)).unwrap(),
    );
    let auth = Arc::new(AuthService::new(
        Arc::new(SqliteAccountStore::open_in_memory().unwrap()),
        tokens.clone(),
        chrono::Duration::days(7),
    ));

    let supervisor = Supervisor::new(SupervisorConfig {
        probe_interval: Duration::from_millis(50),
        checker_deadline: Duration::from_millis(500),
        shutdown_timeout: Duration::from_secs(2),
        install_signal_handlers: false,
    })
    .build();
    supervisor.start();

    let registry = Arc::new(SocketRegistry::new());
    let realtime = Arc::new(RealtimeServer::new(
        chat.clone(),
        registry.clone(),
        tokens.clone(),
        supervisor.cancellation_token(),
    ));

    let weights = Arc::new(WeightManager::new(Arc::new(InMemoryWeightStore::default())));
    let ranking = Arc::new(RankingEngine::new(weights.clone()));
    let consent = Arc::new(InMemoryConsentOracle::default());
    let limits = Arc::new(
        RateLimits::new(&tether::config::RateLimitConfig {
            per_minute: options.per_minute,
            ai_per_minute: options.ai_per_minute,
        })
        .unwrap(),
    );

    let state = AppState {
        environment: tether::config::Environment::Development,
        auth,
        tokens,
        chat,
        realtime,
        supervisor: supervisor.clone(),
        summarizer: options.summarizer,
        consent: consent.clone(),
        weights,
        ranking,
        limits,
        summary_last_n: 25,
    };

    TestApp {
        router: build_router(state.clone()),
        state,
        consent,
        registry,
        supervisor,
    }
}

impl TestApp {
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Register a user through the HTTP surface; returns (id, token).
    pub async fn register(&self, username: &str) -> (UserId, String) {
        let response = self
            .request(
                "POST",
                "/auth/register",
                None,
                Some(serde_json::json!({
                    "email": format!("{}@example.com", username),
                    "username": username,
                    "password": "a long enough password",
                })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        let id = Uuid::parse_str(body["user"]["id"].as_str().unwrap()).unwrap();
        let token = body["access_token"].as_str().unwrap().to_string();
        (id, token)
    }

    /// Create a direct conversation between two registered users.
    pub async fn direct_conversation(&self, token: &str, other: UserId) -> Uuid {
        let response = self
            .request(
                "POST",
                "/chat/conversations",
                Some(token),
                Some(serde_json::json!({"kind": "direct", "other_user": other})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        Uuid::parse_str(body["id"].as_str().unwrap()).unwrap()
    }
}

pub async fn read_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
