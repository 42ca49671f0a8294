use super::*;
use crate::auth::TokenClaims;
use crate::chat::SqliteChatStore;
use crate::crypto::{FieldCipher, KeyRing};
use async_trait::async_trait;
use axum::http::HeaderValue;
use std::collections::HashMap;

struct StaticTokens(HashMap<String, UserId>);

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<TokenClaims> {
        self.0
            .get(token)
            .map(|user| TokenClaims {
                user_id: *user,
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })
            .ok_or_else(|| TetherError::Authentication("unknown token".into()))
    }
}

struct Fixture {
    server: Arc<RealtimeServer>,
    chat: Arc<ChatService>,
    alice: UserId,
    bob: UserId,
    conv: ConversationId,
}

async fn fixture() -> Fixture {
    let store = Arc::new(SqliteChatStore::open_in_memory().unwrap());
    let cipher = Arc::new(FieldCipher::new(
        KeyRing::new(1, "socket test ring key").unwrap(),
        false,
    ));
    let chat = Arc::new(ChatService::new(store, cipher, 4096));

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conv = chat
        .create_direct_conversation(alice, bob)
        .await
        .unwrap()
        .id;

    let tokens = StaticTokens(HashMap::from([
        ("alice-token".to_string(), alice),
        ("bob-token".to_string(), bob),
    ]));
    let server = Arc::new(RealtimeServer::new(
        chat.clone(),
        Arc::new(SocketRegistry::new()),
        Arc::new(tokens),
        CancellationToken::new(),
    ));
    Fixture {
        server,
        chat,
        alice,
        bob,
        conv,
    }
}

fn ws_headers(protocols: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "sec-websocket-protocol",
        HeaderValue::from_str(protocols).unwrap(),
    );
    headers
}

fn subscribe(server: &RealtimeServer, conv: ConversationId, user: UserId) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    server.registry().register(conv, user, tx);
    rx
}

#[tokio::test]
async fn authorize_happy_path_via_query_token() {
    let f = fixture().await;
    let (conv, user) = f
        .server
        .authorize(&ws_headers("jwt"), &f.conv.to_string(), Some("alice-token"))
        .await
        .unwrap();
    assert_eq!(conv, f.conv);
    assert_eq!(user, f.alice);
}

#[tokio::test]
async fn authorize_accepts_token_in_subprotocol() {
    let f = fixture().await;
    let (_, user) = f
        .server
        .authorize(&ws_headers("jwt, bob-token"), &f.conv.to_string(), None)
        .await
        .unwrap();
    assert_eq!(user, f.bob);
}

#[tokio::test]
async fn authorize_rejects_missing_subprotocol() {
    let f = fixture().await;
    let err = f
        .server
        .authorize(&HeaderMap::new(), &f.conv.to_string(), Some("alice-token"))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Validation { field: "subprotocol", .. }));
}

#[tokio::test]
async fn authorize_rejects_unknown_token() {
    let f = fixture().await;
    let err = f
        .server
        .authorize(&ws_headers("jwt"), &f.conv.to_string(), Some("forged"))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Authentication(_)));
}

#[tokio::test]
async fn authorize_rejects_non_member_without_upgrade() {
    let f = fixture().await;
    let eve = Uuid::new_v4();
    let server = Arc::new(RealtimeServer::new(
        f.chat.clone(),
        Arc::new(SocketRegistry::new()),
        Arc::new(StaticTokens(HashMap::from([("eve-token".to_string(), eve)]))),
        CancellationToken::new(),
    ));

    let err = server
        .authorize(&ws_headers("jwt"), &f.conv.to_string(), Some("eve-token"))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Authorization(_)));
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn authorize_rejects_malformed_conversation_id() {
    let f = fixture().await;
    let err = f
        .server
        .authorize(&ws_headers("jwt"), "not-a-uuid", Some("alice-token"))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Validation { field: "conversation_id", .. }));
}

#[tokio::test]
async fn authorize_rejects_during_shutdown() {
    let f = fixture().await;
    let shutdown = CancellationToken::new();
    let server = RealtimeServer::new(
        f.chat.clone(),
        Arc::new(SocketRegistry::new()),
        Arc::new(StaticTokens(HashMap::new())),
        shutdown.clone(),
    );
    shutdown.cancel();
    let err = server
        .authorize(&ws_headers("jwt"), &f.conv.to_string(), Some("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Transient { .. }));
}

#[tokio::test]
async fn message_frame_persists_and_fans_out() {
    let f = fixture().await;
    let mut alice_rx = subscribe(&f.server, f.conv, f.alice);
    let mut bob_rx = subscribe(&f.server, f.conv, f.bob);
    let (own_tx, mut own_rx) = mpsc::unbounded_channel();

    let frame = serde_json::json!({
        "type": "message",
        "message": { "content": "hi", "kind": "text" }
    });
    f.server
        .handle_frame(f.conv, f.alice, &frame.to_string(), &own_tx, &mut None)
        .await;

    for rx in [&mut alice_rx, &mut bob_rx] {
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.kind, EventType::Message);
        assert_eq!(envelope.user_id, Some(f.alice));
        assert_eq!(envelope.message.unwrap().content, "hi");
    }
    // No error frame on the originating sink.
    assert!(own_rx.try_recv().is_err());

    // And the message hit the store.
    let stored = f
        .chat
        .get_messages(f.conv, f.bob, None, 0, None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "hi");
}

#[tokio::test]
async fn empty_content_errors_back_on_origin_only() {
    let f = fixture().await;
    let mut bob_rx = subscribe(&f.server, f.conv, f.bob);
    let (own_tx, mut own_rx) = mpsc::unbounded_channel();

    let frame = serde_json::json!({
        "type": "message",
        "message": { "content": "" }
    });
    f.server
        .handle_frame(f.conv, f.alice, &frame.to_string(), &own_tx, &mut None)
        .await;

    let error = own_rx.try_recv().unwrap();
    assert_eq!(error.kind, EventType::Error);
    assert!(bob_rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_frame_type_errors_back() {
    let f = fixture().await;
    let (own_tx, mut own_rx) = mpsc::unbounded_channel();

    f.server
        .handle_frame(f.conv, f.alice, r#"{"type":"dance"}"#, &own_tx, &mut None)
        .await;
    assert_eq!(own_rx.try_recv().unwrap().kind, EventType::Error);

    f.server
        .handle_frame(f.conv, f.alice, "not json at all", &own_tx, &mut None)
        .await;
    assert_eq!(own_rx.try_recv().unwrap().kind, EventType::Error);
}

#[tokio::test]
async fn heartbeat_echoes_to_origin_only() {
    let f = fixture().await;
    let mut bob_rx = subscribe(&f.server, f.conv, f.bob);
    let (own_tx, mut own_rx) = mpsc::unbounded_channel();

    f.server
        .handle_frame(f.conv, f.alice, r#"{"type":"heartbeat"}"#, &own_tx, &mut None)
        .await;

    assert_eq!(own_rx.try_recv().unwrap().kind, EventType::Heartbeat);
    assert!(bob_rx.try_recv().is_err());
}

#[tokio::test]
async fn typing_frames_coalesce_within_window() {
    let f = fixture().await;
    let mut bob_rx = subscribe(&f.server, f.conv, f.bob);
    let (own_tx, _own_rx) = mpsc::unbounded_channel();
    let mut last_typing = None;

    for _ in 0..3 {
        f.server
            .handle_frame(f.conv, f.alice, r#"{"type":"typing"}"#, &own_tx, &mut last_typing)
            .await;
    }

    // Only the first typing event inside the window is broadcast.
    assert_eq!(bob_rx.try_recv().unwrap().kind, EventType::Typing);
    assert!(bob_rx.try_recv().is_err());

    // stop_typing resets the window and is always forwarded.
    f.server
        .handle_frame(f.conv, f.alice, r#"{"type":"stop_typing"}"#, &own_tx, &mut last_typing)
        .await;
    assert_eq!(bob_rx.try_recv().unwrap().kind, EventType::StopTyping);
    f.server
        .handle_frame(f.conv, f.alice, r#"{"type":"typing"}"#, &own_tx, &mut last_typing)
        .await;
    assert_eq!(bob_rx.try_recv().unwrap().kind, EventType::Typing);
}

#[tokio::test]
async fn frame_for_other_conversation_is_rejected() {
    let f = fixture().await;
    let (own_tx, mut own_rx) = mpsc::unbounded_channel();

    let frame = serde_json::json!({
        "type": "message",
        "conversation_id": Uuid::new_v4(),
        "message": { "content": "misrouted" }
    });
    f.server
        .handle_frame(f.conv, f.alice, &frame.to_string(), &own_tx, &mut None)
        .await;
    assert_eq!(own_rx.try_recv().unwrap().kind, EventType::Error);
}
