//! HTTP surface for the service fleet.
//!
//! Routes: `/auth/*` (account service), `/chat/*` (conversation core +
//! realtime upgrade), `/discovery/*` (ranking weights + scoring),
//! `/health/*` (supervisor). Every non-health route passes the
//! readiness gate and the global rate limit; errors project to a status
//! plus a stable machine code, with PII scrubbed in production.

mod limits;

pub use limits::RateLimits;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{AuthService, TokenPair, TokenValidator, UserRecord};
use crate::chat::{ChatService, ConversationKind, MessageKind, NewMessage, UserId};
use crate::config::Environment;
use crate::consent::{CONSENT_AI_PROCESSING, ConsentOracle};
use crate::errors::TetherError;
use crate::health::Supervisor;
use crate::providers::Summarizer;
use crate::ranking::{GeoPoint, RankingContext, RankingEngine, RankingInput, WeightManager, WeightPatch};
use crate::realtime::{REQUIRED_SUBPROTOCOL, RealtimeServer};

#[derive(Clone)]
pub struct AppState {
    pub environment: Environment,
    pub auth: Arc<AuthService>,
    pub tokens: Arc<dyn TokenValidator>,
    pub chat: Arc<ChatService>,
    pub realtime: Arc<RealtimeServer>,
    pub supervisor: Arc<Supervisor>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub consent: Arc<dyn ConsentOracle>,
    pub weights: Arc<WeightManager>,
    pub ranking: Arc<RankingEngine>,
    pub limits: Arc<RateLimits>,
    pub summary_last_n: u32,
}

impl AppState {
    fn err(&self, error: TetherError) -> ApiError {
        ApiError(self.environment, error)
    }
}

// ---------------------------------------------------------------------------
// Error projection
// ---------------------------------------------------------------------------

pub struct ApiError(Environment, TetherError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(environment, error) = self;
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("request failed: {}", error);
        }

        let message = if environment.is_production() {
            scrub_pii(&error.to_string())
        } else {
            error.to_string()
        };
        let mut body = serde_json::json!({
            "error": {
                "code": error.machine_code(),
                "message": message,
            }
        });
        if let TetherError::RateLimited {
            retry_after: Some(secs),
        } = &error
        {
            body["error"]["retry_after"] = serde_json::json!(secs);
        }
        (status, Json(body)).into_response()
    }
}

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid pattern")
});
static LONG_DIGITS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{6,}").expect("valid pattern"));

/// Redact emails and long digit runs from client-visible error strings.
pub fn scrub_pii(message: &str) -> String {
    let scrubbed = EMAIL_PATTERN.replace_all(message, "[redacted]");
    LONG_DIGITS_PATTERN
        .replace_all(&scrubbed, "[redacted]")
        .into_owned()
}

/// Conversation-scoped routes answer 404 for non-members so that a
/// conversation's existence is not leaked.
fn mask_membership(error: TetherError) -> TetherError {
    match error {
        TetherError::Authorization(_) => TetherError::not_found("conversation"),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, TetherError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| TetherError::Authentication("missing bearer token".into()))?;
    Ok(state.tokens.validate(token).await?.user_id)
}

fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map_or_else(|| "local".to_string(), |ip| ip.trim().to_string())
}

/// Readiness gate + global rate limit for every non-health route.
async fn gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.supervisor.is_ready() {
        return state
            .err(TetherError::transient("service is not accepting traffic", None))
            .into_response();
    }
    if let Err(e) = state.limits.check_global(&client_key(request.headers())) {
        return state.err(e).into_response();
    }
    next.run(request).await
}

fn parse_conversation_id(raw: &str) -> Result<Uuid, TetherError> {
    Uuid::parse_str(raw)
        .map_err(|_| TetherError::validation("conversation_id", "not a valid identifier"))
}

// ---------------------------------------------------------------------------
// Auth handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct UserDto {
    id: UserId,
    email: String,
    username: String,
}

impl From<&UserRecord> for UserDto {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
        }
    }
}

#[derive(Serialize)]
struct AuthResponse {
    user: UserDto,
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl AuthResponse {
    fn new(user: &UserRecord, pair: TokenPair) -> Self {
        Self {
            user: user.into(),
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: pair.expires_at,
        }
    }
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let (user, pair) = state
        .auth
        .register(&body.email, &body.username, &body.password)
        .await
        .map_err(|e| state.err(e))?;
    Ok((StatusCode::CREATED, Json(AuthResponse::new(&user, pair))).into_response())
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let (user, pair) = state
        .auth
        .login(&body.email, &body.password)
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(AuthResponse::new(&user, pair)).into_response())
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Response, ApiError> {
    let pair = state
        .auth
        .refresh(&body.refresh_token)
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(pair).into_response())
}

// ---------------------------------------------------------------------------
// Chat handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    before: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    kind: ConversationKind,
    /// Direct conversations: the other participant.
    other_user: Option<UserId>,
    /// Group conversations: the initial participant set.
    #[serde(default)]
    participants: Vec<UserId>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    conversation_id: Uuid,
    content: String,
    #[serde(default)]
    kind: MessageKind,
    parent: Option<Uuid>,
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let summaries = state
        .chat
        .list_conversations(user, page.limit, page.offset.unwrap_or(0))
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(summaries).into_response())
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationRequest>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let conversation = match body.kind {
        ConversationKind::Direct => {
            let other = body.other_user.ok_or_else(|| {
                state.err(TetherError::validation(
                    "other_user",
                    "required for direct conversations",
                ))
            })?;
            state
                .chat
                .create_direct_conversation(user, other)
                .await
                .map_err(|e| state.err(e))?
        }
        ConversationKind::Group => state
            .chat
            .create_group_conversation(user, body.name, body.participants)
            .await
            .map_err(|e| state.err(e))?,
    };
    Ok((StatusCode::CREATED, Json(conversation)).into_response())
}

async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let conv = parse_conversation_id(&id).map_err(|e| state.err(e))?;
    let messages = state
        .chat
        .get_messages(conv, user, query.limit, query.offset.unwrap_or(0), query.before)
        .await
        .map_err(|e| state.err(mask_membership(e)))?;
    Ok(Json(messages).into_response())
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let message = state
        .chat
        .send_message(
            body.conversation_id,
            user,
            NewMessage {
                content: body.content,
                kind: body.kind,
                parent: body.parent,
            },
        )
        .await
        .map_err(|e| state.err(mask_membership(e)))?;
    Ok((StatusCode::CREATED, Json(message)).into_response())
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    state
        .chat
        .mark_read(id, user)
        .await
        .map_err(|e| state.err(e))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn summarize_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let conv = parse_conversation_id(&id).map_err(|e| state.err(e))?;

    state
        .limits
        .check_ai(&user.to_string())
        .map_err(|e| state.err(e))?;
    let consented = state
        .consent
        .has_consent(user, CONSENT_AI_PROCESSING)
        .await
        .map_err(|e| state.err(e))?;
    if !consented {
        return Err(state.err(TetherError::Authorization(
            "AI processing requires consent".into(),
        )));
    }

    let messages = state
        .chat
        .recent_messages(conv, user, state.summary_last_n)
        .await
        .map_err(|e| state.err(mask_membership(e)))?;
    let summarizer = state.summarizer.as_ref().ok_or_else(|| {
        state.err(TetherError::transient("summarizer is not configured", None))
    })?;
    let summary = summarizer
        .summarize(conv, &messages)
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(serde_json::json!({ "summary": summary })).into_response())
}

// ---------------------------------------------------------------------------
// Realtime upgrade
// ---------------------------------------------------------------------------

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match state
        .realtime
        .authorize(&headers, &id, params.get("token").map(String::as_str))
        .await
    {
        Ok((conv, user)) => {
            let server = state.realtime.clone();
            ws.protocols([REQUIRED_SUBPROTOCOL])
                .on_upgrade(move |socket| server.serve_connection(socket, conv, user))
        }
        Err(e) => state.err(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Discovery handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RankCandidate {
    user: UserId,
    semantic_sim: f64,
    #[serde(default)]
    interest_bits: Vec<u8>,
    location: Option<GeoPoint>,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RankRequest {
    #[serde(default)]
    interest_bits: Vec<u8>,
    location: Option<GeoPoint>,
    candidates: Vec<RankCandidate>,
}

async fn get_weights(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let weights = state.weights.current().await.map_err(|e| state.err(e))?;
    Ok(Json(weights).into_response())
}

async fn update_weights(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<WeightPatch>,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let weights = state.weights.update(patch).await.map_err(|e| state.err(e))?;
    Ok(Json(weights).into_response())
}

async fn reset_weights(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let weights = state.weights.reset().await.map_err(|e| state.err(e))?;
    Ok(Json(weights).into_response())
}

async fn rank_candidates(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RankRequest>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await.map_err(|e| state.err(e))?;
    let ctx = RankingContext {
        user,
        interest_bits: body.interest_bits,
        location: body.location,
    };
    let candidates: Vec<RankingInput> = body
        .candidates
        .into_iter()
        .map(|c| RankingInput {
            user: c.user,
            semantic_sim: c.semantic_sim.clamp(0.0, 1.0),
            interest_bits: c.interest_bits,
            location: c.location,
            last_seen: c.last_seen,
        })
        .collect();
    let ranked = state
        .ranking
        .rank(&ctx, &candidates, Utc::now())
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(ranked).into_response())
}

// ---------------------------------------------------------------------------
// Health handlers
// ---------------------------------------------------------------------------

async fn health_live(State(state): State<AppState>) -> Response {
    if state.supervisor.is_live() {
        Json(serde_json::json!({"status": "ok", "version": crate::VERSION})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "stopped"})),
        )
            .into_response()
    }
}

async fn health_ready(State(state): State<AppState>) -> Response {
    let body = Json(serde_json::json!({"state": state.supervisor.state()}));
    if state.supervisor.is_ready() {
        body.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn health_detailed(State(state): State<AppState>) -> Response {
    let (service_state, checks, all_ok) = state.supervisor.snapshot();
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "state": service_state,
            "healthy": all_ok,
            "checks": checks,
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Router + server
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/chat/conversations", get(list_conversations).post(create_conversation))
        .route("/chat/conversations/{id}/messages", get(get_messages))
        .route("/chat/conversations/{id}/summary", post(summarize_conversation))
        .route("/chat/messages", post(send_message))
        .route("/chat/messages/{id}/read", post(mark_read))
        .route("/chat/ws/{id}", get(ws_upgrade))
        .route("/discovery/weights", get(get_weights).put(update_weights))
        .route("/discovery/weights/reset", post(reset_weights))
        .route("/discovery/rank", post(rank_candidates))
        .layer(middleware::from_fn_with_state(state.clone(), gate));

    let health = Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/health/detailed", get(health_detailed));

    api.merge(health).with_state(state)
}

/// Bind and serve until the supervisor's token cancels; the supervisor
/// is told when the listener has drained so shutdown can finalize.
pub async fn start(
    state: AppState,
    host: &str,
    port: u16,
) -> anyhow::Result<(tokio::task::JoinHandle<()>, std::net::SocketAddr)> {
    let supervisor = state.supervisor.clone();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
    let addr = listener.local_addr()?;
    info!("gateway listening on {}", addr);

    supervisor.attach_server();
    let token = supervisor.cancellation_token();
    let handle = tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("gateway server error: {}", e);
        }
        supervisor.notify_server_closed();
    });
    Ok((handle, addr))
}
