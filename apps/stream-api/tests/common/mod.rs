//! Shared test harness: an in-memory AppState served on a real listener,
//! plus HTTP and gateway helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time;
use tokio_tungstenite::tungstenite;

use stream_api::config::Config;
use stream_api::db::kv::{KeyValueStore, MemoryKv};
use stream_api::db::store::{MemoryStore, StreamStore};
use stream_api::gateway::directory::RoomDirectory;
use stream_api::gateway::fanout::GatewayBroadcast;
use stream_api::gateway::presence::PresenceTracker;
use stream_api::gateway::sync::SyncAdapter;
use stream_api::AppState;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestApp {
    pub addr: SocketAddr,
    pub state: AppState,
    /// Typed handles so tests can flip the failure switches and inspect
    /// durable state directly.
    pub store: Arc<MemoryStore>,
    pub kv: Arc<MemoryKv>,
}

/// Start the full router on 127.0.0.1:0 with in-memory backends.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

pub async fn spawn_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKv::new());
    let store_dyn: Arc<dyn StreamStore> = store.clone();
    let kv_dyn: Arc<dyn KeyValueStore> = kv.clone();

    let mut config = Config {
        database_url: "postgres://unused".to_string(),
        redis_url: None,
        jwt_secret: "test-secret".to_string(),
        port: 0,
        chat_rate_limit_enabled: false,
    };
    configure(&mut config);

    let state = AppState {
        store: store_dyn.clone(),
        kv: kv_dyn.clone(),
        config: Arc::new(config),
        rooms: Arc::new(RoomDirectory::new()),
        presence: Arc::new(PresenceTracker::new(kv_dyn.clone())),
        sync: Arc::new(SyncAdapter::new(store_dyn, kv_dyn)),
        broadcast: GatewayBroadcast::new(),
    };

    let app = stream_api::routes::router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        state,
        store,
        kv,
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Register a user and return (token, user_id).
pub async fn register(app: &TestApp, username: &str) -> (String, String) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/auth/register", app.addr))
        .json(&serde_json::json!({
            "username": username,
            "email": format!("{username}@example.com"),
            "password": "password123",
        }))
        .send()
        .await
        .expect("register request");
    assert_eq!(resp.status(), 201, "register should succeed");

    let body: serde_json::Value = resp.json().await.expect("parse register response");
    (
        body["token"].as_str().expect("token").to_string(),
        body["user"]["id"].as_str().expect("user id").to_string(),
    )
}

/// Create a live room record over HTTP and return its room id.
pub async fn create_room_record(app: &TestApp, token: &str, title: &str) -> String {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/rooms", app.addr))
        .header("Authorization", format!("Bearer {token}"))
        .json(&serde_json::json!({ "title": title }))
        .send()
        .await
        .expect("create room request");
    assert_eq!(resp.status(), 201, "room creation should succeed");

    let body: serde_json::Value = resp.json().await.expect("parse room response");
    body["room_id"].as_str().expect("room_id").to_string()
}

// ---------------------------------------------------------------------------
// Gateway helpers
// ---------------------------------------------------------------------------

/// Connect to the gateway, IDENTIFY with the token, and assert the ready
/// dispatch.
pub async fn connect_and_identify(addr: SocketAddr, token: &str) -> WsStream {
    let url = format!("ws://{addr}/gateway");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    let identify = serde_json::json!({
        "op": 2,
        "d": { "token": token }
    });
    ws.send(tungstenite::Message::Text(identify.to_string().into()))
        .await
        .expect("send identify");

    let ready = read_json(&mut ws).await;
    assert_eq!(ready["op"], 0, "ready should be a dispatch");
    assert_eq!(ready["t"], "ready");
    assert!(ready["d"]["sessionId"].as_str().unwrap().starts_with("conn_"));

    ws
}

/// Send a client request frame (op=4).
pub async fn send_request(ws: &mut WsStream, event: &str, nonce: u64, data: serde_json::Value) {
    let frame = serde_json::json!({
        "op": 4,
        "t": event,
        "n": nonce,
        "d": data,
    });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send request");
}

/// Read the next text frame as JSON, with a timeout.
pub async fn read_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for ws message")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse ws json");
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected ws message: {other:?}"),
        }
    }
}

/// Read frames until the ack (op=5) for the given nonce arrives, skipping
/// interleaved dispatches. Returns the ack payload.
pub async fn read_ack(ws: &mut WsStream, nonce: u64) -> serde_json::Value {
    loop {
        let msg = read_json(ws).await;
        if msg["op"] == 5 && msg["n"] == nonce {
            return msg["d"].clone();
        }
    }
}

/// Read frames until a dispatch (op=0) with the given event name arrives.
/// Returns the dispatch payload.
pub async fn read_dispatch(ws: &mut WsStream, event: &str) -> serde_json::Value {
    loop {
        let msg = read_json(ws).await;
        if msg["op"] == 0 && msg["t"] == event {
            return msg["d"].clone();
        }
    }
}

/// Send a request and return its ack payload.
pub async fn request(
    ws: &mut WsStream,
    event: &str,
    nonce: u64,
    data: serde_json::Value,
) -> serde_json::Value {
    send_request(ws, event, nonce, data).await;
    read_ack(ws, nonce).await
}

/// Poll a condition until it holds or the deadline passes. Used where a
/// broadcast observed on one socket races the final in-memory mutation.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

/// Assert that no frame arrives within the window.
pub async fn expect_silence(ws: &mut WsStream, window: Duration) {
    let result = time::timeout(window, ws.next()).await;
    if let Ok(Some(Ok(msg))) = result {
        panic!("expected silence, got: {msg:?}");
    }
}
