use super::*;
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::events::ChatMessageNotice;
use crate::session::SessionManager;
use crate::store::MemoryStore;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct Fixture {
    bus: Arc<EventBus>,
    api: Api,
    registry: Arc<TopicRegistry>,
}

/// Everything wired, pointing at a port nothing listens on.
fn fixture() -> Fixture {
    fixture_at("http://127.0.0.1:9")
}

fn fixture_at(api_url: &str) -> Fixture {
    let config = ClientConfig { api_url: api_url.into(), ..ClientConfig::default() };
    let bus = Arc::new(EventBus::new());
    let session =
        Arc::new(SessionManager::new(&config, Arc::clone(&bus), Arc::new(MemoryStore::new())).unwrap());
    let connection = ConnectionManager::from_config(&config, Arc::clone(&bus));
    let registry = TopicRegistry::new(connection, Arc::clone(&bus));
    Fixture { bus, api: Api::new(session), registry }
}

fn message(id: &str, content: &str) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        role: "user".into(),
        content: content.into(),
        timestamp: None,
        metadata: serde_json::Value::Null,
        client_id: None,
    }
}

fn pushed(chat_id: &str, message: ChatMessage) -> Event {
    Event::NewChatMessage(ChatMessageNotice { chat_id: chat_id.into(), message, timestamp: None })
}

#[test]
fn chat_message_correlates_on_client_id() {
    let mut m = message("m1", "hi");
    assert_eq!(m.server_id(), "m1");
    assert_eq!(m.correlation_id(), None);
    m.client_id = Some("tmp-1".into());
    assert_eq!(m.correlation_id(), Some("tmp-1"));
}

#[test]
fn open_joins_room_and_close_leaves_it() {
    let f = fixture();
    let chat = ChatSession::open("42", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));
    assert_eq!(f.registry.count("chat:42"), 1);

    chat.close();
    chat.close();
    assert_eq!(f.registry.count("chat:42"), 0);
    assert_eq!(f.bus.listener_count(EventKind::NewChatMessage), 0);
}

#[test]
fn two_views_share_one_room() {
    let f = fixture();
    let a = ChatSession::open("7", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));
    let b = ChatSession::open("7", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));
    assert_eq!(f.registry.count("chat:7"), 2);

    drop(a);
    assert_eq!(f.registry.count("chat:7"), 1);
    drop(b);
    assert_eq!(f.registry.count("chat:7"), 0);
}

#[test]
fn pushes_for_this_conversation_are_merged() {
    let f = fixture();
    let chat = ChatSession::open("42", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));

    f.bus.emit(&pushed("42", message("m1", "from another participant")));
    f.bus.emit(&pushed("99", message("m2", "elsewhere")));

    let ids: Vec<String> = chat
        .messages()
        .iter()
        .filter_map(|e| e.confirmed().map(|m| m.id.clone()))
        .collect();
    assert_eq!(ids, vec!["m1".to_owned()]);
}

#[tokio::test]
async fn failed_send_rolls_back_and_surfaces_network_error() {
    let f = fixture();
    let chat = ChatSession::open("42", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));

    let err = chat.send("Hi").await.unwrap_err();

    assert!(matches!(err, ClientError::Network(_)), "{err:?}");
    assert!(chat.messages().is_empty());
    assert!(!chat.is_sending());
}

// =============================================================================
// AGAINST A LOCAL SERVER
// =============================================================================

/// The first post to a conversation never gets an answer; later ones echo
/// the message back with a generated reply.
async fn reply_after_first(
    State(posts): State<Arc<AtomicUsize>>,
    Path(chat_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    if posts.fetch_add(1, Ordering::SeqCst) == 0 {
        std::future::pending::<()>().await;
    }
    Json(json!({
        "chat_id": chat_id,
        "messages": [
            { "id": "m1", "role": "user", "content": body["message"], "client_id": body["client_id"] },
            { "id": "m2", "role": "assistant", "content": "Noted." },
        ],
    }))
}

async fn cleared() -> Json<Value> {
    Json(json!({ "message": "Chat cleared" }))
}

async fn serve() -> String {
    let app = Router::new()
        .route("/api/chat/{chat_id}/messages", post(reply_after_first))
        .route("/api/chat/{chat_id}/clear", post(cleared))
        .with_state(Arc::new(AtomicUsize::new(0)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/api")
}

#[tokio::test]
async fn cancelled_send_rolls_back_and_frees_the_conversation() {
    let f = fixture_at(&serve().await);
    let chat = ChatSession::open("42", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));

    let cancelled = tokio::time::timeout(Duration::from_millis(200), chat.send("Hi")).await;
    assert!(cancelled.is_err(), "first post is never answered");
    assert!(!chat.is_sending());
    assert!(chat.messages().is_empty());

    let entries = chat.send("Hi again").await.unwrap();
    let contents: Vec<&str> = entries.iter().filter_map(|e| e.confirmed()).map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["Hi again", "Noted."]);
}

#[tokio::test]
async fn clear_empties_the_local_list() {
    let f = fixture_at(&serve().await);
    let chat = ChatSession::open("42", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));
    f.bus.emit(&pushed("42", message("m9", "earlier")));
    assert_eq!(chat.messages().len(), 1);

    chat.clear().await.unwrap();
    assert!(chat.messages().is_empty());
}

#[tokio::test]
async fn failed_clear_keeps_the_local_list() {
    let f = fixture();
    let chat = ChatSession::open("42", f.api.clone(), Arc::clone(&f.registry), Arc::clone(&f.bus));
    f.bus.emit(&pushed("42", message("m9", "earlier")));

    assert!(matches!(chat.clear().await, Err(ClientError::Network(_))));
    assert_eq!(chat.messages().len(), 1);
}
