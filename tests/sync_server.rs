//! End-to-end checks against an in-process HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use docsync::config::ReconnectPolicy;
use docsync::session::RequestOptions;
use docsync::connection::ConnectionStatus;
use docsync::events::{Event, EventKind};
use docsync::store::{CredentialStore, MemoryStore};
use docsync::{ClientConfig, ClientError, SyncContext};
use futures_util::future::join_all;
use reqwest::Method;
use serde_json::{Value, json};
use tokio::sync::mpsc;

const TOKEN: &str = "good-token";
const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// SERVER
// =============================================================================

#[derive(Clone, Default)]
struct ServerState {
    /// Close the first push connection right after its first room join.
    drop_first: bool,
    connections: Arc<AtomicUsize>,
    frames: Arc<Mutex<Vec<(usize, Value)>>>,
}

impl ServerState {
    fn joins_on(&self, conn: usize) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, f)| *c == conn && f["event"] == "join_chat_room")
            .map(|(_, f)| f["data"].clone())
            .collect()
    }
}

fn text(event: &str, data: Value) -> Message {
    Message::Text(json!({ "event": event, "data": data }).to_string().into())
}

async fn login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["password"] != "secret" {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid credentials" })));
    }
    let user = json!({ "id": "u1", "email": body["email"], "name": "Ada" });
    (
        StatusCode::OK,
        Json(json!({ "message": "Login successful", "access_token": TOKEN, "refresh_token": "r1", "user": user })),
    )
}

async fn expired() -> (StatusCode, Json<Value>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    (StatusCode::UNAUTHORIZED, Json(json!({ "msg": "Token has expired" })))
}

async fn send_message(Path(chat_id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "chat_id": chat_id,
        "messages": [
            { "id": "m1", "role": "user", "content": body["message"], "client_id": body["client_id"] },
            { "id": "m2", "role": "assistant", "content": "Noted." },
        ],
    }))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({}))
}

async fn dashboard_down() -> (StatusCode, Json<Value>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "analytics store unavailable" })))
}

async fn create_chat_rejected() -> (StatusCode, Json<Value>) {
    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": "Title is required" })))
}

async fn refresh(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let bearer = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if bearer != Some("Bearer r1") {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "msg": "Invalid refresh token" })));
    }
    (StatusCode::OK, Json(json!({ "access_token": "fresh-token" })))
}

async fn upload(headers: HeaderMap, body: Bytes) -> (StatusCode, Json<Value>) {
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();
    let body = String::from_utf8_lossy(&body);
    if !content_type.starts_with("multipart/form-data") || !body.contains("filename=\"notes.txt\"") {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "No file provided" })));
    }
    let has_content = body.contains("hello world");
    (StatusCode::CREATED, Json(json!({ "document_id": "d1", "filename": "notes.txt", "has_content": has_content })))
}

async fn get_document(Path(document_id): Path<String>) -> Json<Value> {
    Json(json!({ "document": { "id": document_id, "filename": "notes.txt", "size": 11, "tags": ["draft"] } }))
}

async fn ws_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

async fn run_ws(mut socket: WebSocket, state: ServerState) {
    let conn = state.connections.fetch_add(1, Ordering::SeqCst);

    let Some(Ok(Message::Text(hello))) = socket.recv().await else {
        return;
    };
    let hello: Value = serde_json::from_str(hello.as_str()).unwrap_or_default();
    if hello["event"] != "handshake" || hello["data"]["token"] != TOKEN {
        let _ = socket.send(text("error", json!({ "message": "invalid token" }))).await;
        return;
    }
    if socket.send(text("connected", json!({}))).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(raw) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(raw.as_str()) else { continue };
        state.frames.lock().unwrap().push((conn, frame.clone()));

        if frame["event"] == "join_chat_room" {
            let ack = text("joined_chat_room", json!({ "chat_id": frame["data"]["chat_id"] }));
            if socket.send(ack).await.is_err() {
                return;
            }
            if state.drop_first && conn == 0 {
                return;
            }
        }
    }
}

async fn spawn_server(state: ServerState) -> SocketAddr {
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/documents/", get(expired))
        .route("/api/documents/upload", post(upload))
        .route("/api/documents/{document_id}", get(get_document))
        .route("/api/slow", get(slow))
        .route("/api/analytics/dashboard", get(dashboard_down))
        .route("/api/chat/", post(create_chat_rejected))
        .route("/api/chat/{chat_id}/messages", post(send_message))
        .route("/ws", get(ws_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

// =============================================================================
// CLIENT
// =============================================================================

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        api_url: format!("http://{addr}/api"),
        ws_url: format!("ws://{addr}/ws"),
        reconnect: ReconnectPolicy { base_delay: Duration::from_millis(50), max_attempts: 5 },
        ..ClientConfig::default()
    }
}

fn forward(ctx: &SyncContext, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in kinds {
        let tx = tx.clone();
        ctx.bus().on(*kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    rx
}

async fn next_of(rx: &mut mpsc::UnboundedReceiver<Event>, kind: EventKind) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("bus dropped");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn concurrent_auth_failures_invalidate_the_session_once() {
    let addr = spawn_server(ServerState::default()).await;
    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::new(config(addr), store.clone()).unwrap();
    ctx.init().unwrap();
    ctx.session().set_session("stale", Some("r0".into()), None);

    let invalidations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invalidations);
    ctx.bus().on(EventKind::SessionInvalidated, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let results = join_all((0..8).map(|_| ctx.api().list_documents(0, 20))).await;

    assert!(results.iter().all(|r| matches!(r, Err(ClientError::Auth(_)))));
    assert_eq!(invalidations.load(Ordering::SeqCst), 1);
    assert!(!ctx.session().is_authenticated());
    assert!(store.load().unwrap().is_empty());
}

#[tokio::test]
async fn wrong_password_is_an_auth_error_without_invalidation() {
    let addr = spawn_server(ServerState::default()).await;
    let ctx = SyncContext::new(config(addr), Arc::new(MemoryStore::new())).unwrap();
    ctx.init().unwrap();
    let mut rx = forward(&ctx, &[EventKind::SessionInvalidated]);

    let err = ctx.login("ada@example.com", "nope").await.unwrap_err();

    assert_eq!(err, ClientError::Auth("Invalid credentials".into()));
    assert!(rx.try_recv().is_err(), "no credential was held, so nothing to invalidate");
}

#[tokio::test]
async fn login_connects_and_send_reconciles_with_the_server_reply() {
    let addr = spawn_server(ServerState::default()).await;
    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::new(config(addr), store.clone()).unwrap();
    ctx.init().unwrap();
    let mut rx = forward(&ctx, &[EventKind::Connected, EventKind::RoomAck]);

    let user = ctx.login("ada@example.com", "secret").await.unwrap();
    assert_eq!(user.name, "Ada");
    assert_eq!(store.load().unwrap().refresh_token.as_deref(), Some("r1"));
    next_of(&mut rx, EventKind::Connected).await;

    let chat = ctx.open_chat("42");
    let ack = next_of(&mut rx, EventKind::RoomAck).await;
    assert_eq!(ack, Event::RoomAck { event: "joined_chat_room".into(), room: "chat:42".into() });

    let mut updates = chat.subscribe();
    let entries = chat.send("Hello").await.unwrap();
    let ids: Vec<&str> = entries.iter().filter_map(|e| e.confirmed()).map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(entries[0].confirmed().unwrap().content, "Hello");

    // Observers see the pending list and then the reconciled one, nothing in between.
    assert!(updates.has_changed().unwrap());
    assert_eq!(updates.borrow_and_update().len(), 2);

    ctx.dispose();
}

#[tokio::test]
async fn rooms_are_rejoined_after_the_server_drops_the_channel() {
    let state = ServerState { drop_first: true, ..ServerState::default() };
    let addr = spawn_server(state.clone()).await;
    let ctx = SyncContext::new(config(addr), Arc::new(MemoryStore::new())).unwrap();
    ctx.init().unwrap();
    let mut rx = forward(&ctx, &[EventKind::Connected, EventKind::Disconnected, EventKind::Reconnecting]);

    ctx.registry().join("document:d1");
    let _chat = ctx.open_chat("42");
    ctx.use_token(TOKEN);

    next_of(&mut rx, EventKind::Connected).await;
    next_of(&mut rx, EventKind::Disconnected).await;
    let scheduled = next_of(&mut rx, EventKind::Reconnecting).await;
    assert_eq!(scheduled, Event::Reconnecting { attempt: 1, delay: Duration::from_millis(50) });
    next_of(&mut rx, EventKind::Connected).await;

    // Give the replayed frames time to reach the server.
    tokio::time::timeout(WAIT, async {
        while state.joins_on(1).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(state.joins_on(0), vec![json!({ "chat_id": "42" })]);
    assert_eq!(state.joins_on(1), vec![json!({ "chat_id": "42" })]);
    let second: Vec<String> = state
        .frames
        .lock()
        .unwrap()
        .iter()
        .filter(|(c, _)| *c == 1)
        .map(|(_, f)| f["event"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(second[..2], ["join_document_room".to_owned(), "join_chat_room".to_owned()]);
    assert_eq!(ctx.connection().status(), ConnectionStatus::Connected);
    assert_eq!(ctx.connection().attempt(), 0);
}

#[tokio::test]
async fn rejected_handshake_is_reported_and_retried() {
    let addr = spawn_server(ServerState::default()).await;
    let ctx = SyncContext::new(config(addr), Arc::new(MemoryStore::new())).unwrap();
    ctx.init().unwrap();
    let mut rx = forward(&ctx, &[EventKind::ConnectionError, EventKind::Reconnecting]);

    ctx.use_token("wrong");
    let Event::ConnectionError { error } = next_of(&mut rx, EventKind::ConnectionError).await else {
        unreachable!()
    };
    assert!(error.contains("invalid token"), "{error}");
    next_of(&mut rx, EventKind::Reconnecting).await;

    ctx.dispose();
}

#[tokio::test]
async fn request_past_the_timeout_is_a_network_error() {
    let addr = spawn_server(ServerState::default()).await;
    let config = ClientConfig { request_timeout: Duration::from_millis(200), ..config(addr) };
    let ctx = SyncContext::new(config, Arc::new(MemoryStore::new())).unwrap();

    let err = ctx.session().request(Method::GET, "/slow", None, RequestOptions::default()).await.unwrap_err();
    assert!(matches!(&err, ClientError::Network(m) if m.contains("timed out")), "{err:?}");

    let short = RequestOptions::default().with_timeout(Duration::from_millis(50));
    let err = ctx.session().request(Method::GET, "/slow", None, short).await.unwrap_err();
    assert!(matches!(err, ClientError::Network(_)), "{err:?}");
}

#[tokio::test]
async fn server_and_validation_failures_carry_the_server_message() {
    let addr = spawn_server(ServerState::default()).await;
    let ctx = SyncContext::new(config(addr), Arc::new(MemoryStore::new())).unwrap();

    let err = ctx.api().dashboard().await.unwrap_err();
    assert_eq!(err, ClientError::Server { status: 500, message: "analytics store unavailable".into() });

    let err = ctx.api().create_chat(None, "").await.unwrap_err();
    assert_eq!(err, ClientError::Validation { status: 422, message: "Title is required".into() });
}

#[tokio::test]
async fn refresh_swaps_in_and_persists_the_new_token() {
    let addr = spawn_server(ServerState::default()).await;
    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::new(config(addr), store.clone()).unwrap();
    ctx.api().login("ada@example.com", "secret").await.unwrap();

    let token = ctx.api().refresh().await.unwrap();

    assert_eq!(token, "fresh-token");
    assert_eq!(ctx.session().token().as_deref(), Some("fresh-token"));
    let saved = store.load().unwrap();
    assert_eq!(saved.access_token.as_deref(), Some("fresh-token"));
    assert_eq!(saved.refresh_token.as_deref(), Some("r1"));
}

#[tokio::test]
async fn upload_sends_multipart_and_get_document_unwraps_the_envelope() {
    let addr = spawn_server(ServerState::default()).await;
    let ctx = SyncContext::new(config(addr), Arc::new(MemoryStore::new())).unwrap();

    let uploaded = ctx.api().upload_document("notes.txt", b"hello world".to_vec()).await.unwrap();
    assert_eq!(uploaded["document_id"], "d1");
    assert_eq!(uploaded["has_content"], true);

    let doc = ctx.api().get_document("d1").await.unwrap();
    assert_eq!(doc.id, "d1");
    assert_eq!(doc.size, 11);
    assert_eq!(doc.tags, vec!["draft".to_owned()]);
}
