mod common;

use common::{register, spawn_app};

#[tokio::test]
async fn register_then_fetch_own_profile() {
    let app = spawn_app().await;
    let (token, user_id) = register(&app, "alice").await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/api/v1/auth/me", app.addr))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], user_id.as_str());
    assert_eq!(body["username"], "alice");
    assert_eq!(body["is_streaming"], false);
    // The plain profile view never leaks secrets.
    assert!(body.get("password_hash").is_none());
    assert!(body.get("stream_key").is_none());
}

#[tokio::test]
async fn register_validates_input() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/api/v1/auth/register", app.addr))
        .json(&serde_json::json!({
            "username": "ab",
            "email": "not-an-email",
            "password": "short",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    let details = body["error"]["details"].as_array().unwrap();
    assert_eq!(details.len(), 3);
}

#[tokio::test]
async fn duplicate_username_conflicts() {
    let app = spawn_app().await;
    register(&app, "alice").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/auth/register", app.addr))
        .json(&serde_json::json!({
            "username": "alice",
            "email": "other@example.com",
            "password": "password123",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Username is already taken");
}

#[tokio::test]
async fn login_round_trip() {
    let app = spawn_app().await;
    register(&app, "alice").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/auth/login", app.addr))
        .json(&serde_json::json!({ "username": "alice", "password": "password123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["token"].as_str().is_some());
    assert_eq!(body["user"]["username"], "alice");

    // Username lookup is case-insensitive.
    let resp = client
        .post(format!("http://{}/api/v1/auth/login", app.addr))
        .json(&serde_json::json!({ "username": "ALICE", "password": "password123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let app = spawn_app().await;
    register(&app, "alice").await;

    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/api/v1/auth/login", app.addr))
        .json(&serde_json::json!({ "username": "alice", "password": "wrong-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("http://{}/api/v1/auth/login", app.addr))
        .json(&serde_json::json!({ "username": "nobody", "password": "password123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn protected_routes_require_a_token() {
    let app = spawn_app().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/api/v1/auth/me", app.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("http://{}/api/v1/auth/me", app.addr))
        .header("Authorization", "Bearer bogus")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn stream_key_is_private_and_regenerable() {
    let app = spawn_app().await;
    let (token, _) = register(&app, "alice").await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/api/v1/users/@me", app.addr))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let original_key = body["stream_key"].as_str().unwrap().to_string();
    assert_eq!(original_key.len(), 32);

    let resp = client
        .post(format!("http://{}/api/v1/users/@me/stream-key", app.addr))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let new_key = body["stream_key"].as_str().unwrap();
    assert_eq!(new_key.len(), 32);
    assert_ne!(new_key, original_key);
}
