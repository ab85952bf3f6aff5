mod common;

use stream_api::db::kv::KeyValueStore;
use stream_api::db::store::StreamStore;

use common::{connect_and_identify, create_room_record, read_dispatch, register, request, spawn_app};

#[tokio::test]
async fn create_and_list_live_rooms() {
    let app = spawn_app().await;
    let (token, user_id) = register(&app, "alice").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/rooms", app.addr))
        .header("Authorization", format!("Bearer {token}"))
        .json(&serde_json::json!({
            "title": "My stream",
            "description": "First one",
            "category": "music",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let room: serde_json::Value = resp.json().await.unwrap();
    assert!(room["room_id"].as_str().unwrap().starts_with("room_"));
    assert_eq!(room["streamer_id"], user_id.as_str());
    assert_eq!(room["is_live"], true);
    assert_eq!(room["category"], "music");

    let resp = client
        .get(format!("http://{}/api/v1/rooms", app.addr))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["title"], "My stream");

    // The streamer flag is set and the live-room index is populated.
    let user = app.store.find_user_by_id(&user_id).await.unwrap().unwrap();
    assert!(user.is_streaming);
    assert!(app
        .kv
        .hget("live_rooms", room["room_id"].as_str().unwrap())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn second_live_room_is_rejected() {
    let app = spawn_app().await;
    let (token, _) = register(&app, "alice").await;

    create_room_record(&app, &token, "First").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/rooms", app.addr))
        .header("Authorization", format!("Bearer {token}"))
        .json(&serde_json::json!({ "title": "Second" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "You already have a live room");
}

#[tokio::test]
async fn room_title_is_validated() {
    let app = spawn_app().await;
    let (token, _) = register(&app, "alice").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/rooms", app.addr))
        .header("Authorization", format!("Bearer {token}"))
        .json(&serde_json::json!({ "title": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn get_room_by_id() {
    let app = spawn_app().await;
    let (token, _) = register(&app, "alice").await;
    let room_id = create_room_record(&app, &token, "Find me").await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/api/v1/rooms/{}", app.addr, room_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["title"], "Find me");

    let resp = client
        .get(format!("http://{}/api/v1/rooms/room_missing", app.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn only_the_owner_can_end_a_room() {
    let app = spawn_app().await;
    let (token_a, _) = register(&app, "alice").await;
    let (token_b, _) = register(&app, "bob").await;
    let room_id = create_room_record(&app, &token_a, "Mine").await;

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("http://{}/api/v1/rooms/{}", app.addr, room_id))
        .header("Authorization", format!("Bearer {token_b}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .delete(format!("http://{}/api/v1/rooms/{}", app.addr, room_id))
        .header("Authorization", format!("Bearer {token_a}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let record = app
        .store
        .find_room_by_external_id(&room_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.is_live);
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn http_room_end_notifies_gateway_viewers() {
    let app = spawn_app().await;
    let (token_a, _) = register(&app, "alice").await;
    let (token_b, _) = register(&app, "bob").await;
    let room_id = create_room_record(&app, &token_a, "Live now").await;

    let mut ws_a = connect_and_identify(app.addr, &token_a).await;
    request(&mut ws_a, "create-room", 1, serde_json::json!({ "roomId": room_id })).await;

    let mut ws_b = connect_and_identify(app.addr, &token_b).await;
    request(&mut ws_b, "join-room", 2, serde_json::json!({ "roomId": room_id })).await;

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("http://{}/api/v1/rooms/{}", app.addr, room_id))
        .header("Authorization", format!("Bearer {token_a}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let ended = read_dispatch(&mut ws_b, "stream-ended").await;
    assert_eq!(ended["reason"], "Streamer ended the stream");
    assert!(!app.state.rooms.contains(&room_id));
}

#[tokio::test]
async fn ban_lifecycle_over_http() {
    let app = spawn_app().await;
    let (token_a, _) = register(&app, "alice").await;
    let (token_b, user_b) = register(&app, "bob").await;
    let room_id = create_room_record(&app, &token_a, "Ban management").await;

    let client = reqwest::Client::new();

    // Non-owner cannot ban.
    let resp = client
        .post(format!("http://{}/api/v1/rooms/{}/bans", app.addr, room_id))
        .header("Authorization", format!("Bearer {token_b}"))
        .json(&serde_json::json!({ "user_id": "usr_someone" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Owner bans bob.
    let resp = client
        .post(format!("http://{}/api/v1/rooms/{}/bans", app.addr, room_id))
        .header("Authorization", format!("Bearer {token_a}"))
        .json(&serde_json::json!({ "user_id": user_b, "reason": "rude" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let ban: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(ban["user_id"], user_b.as_str());
    assert_eq!(ban["reason"], "rude");

    // Unban lifts it; a second unban is a 404.
    let resp = client
        .delete(format!(
            "http://{}/api/v1/rooms/{}/bans/{}",
            app.addr, room_id, user_b
        ))
        .header("Authorization", format!("Bearer {token_a}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .delete(format!(
            "http://{}/api/v1/rooms/{}/bans/{}",
            app.addr, room_id, user_b
        ))
        .header("Authorization", format!("Bearer {token_a}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn expired_ban_no_longer_blocks_join() {
    let app = spawn_app().await;
    let (token_a, _) = register(&app, "alice").await;
    let (token_b, user_b) = register(&app, "bob").await;
    let room_id = create_room_record(&app, &token_a, "Expired ban").await;

    // A ban that expired a second ago.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/rooms/{}/bans", app.addr, room_id))
        .header("Authorization", format!("Bearer {token_a}"))
        .json(&serde_json::json!({ "user_id": user_b, "duration_secs": -1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let mut ws_a = connect_and_identify(app.addr, &token_a).await;
    request(&mut ws_a, "create-room", 1, serde_json::json!({ "roomId": room_id })).await;

    let mut ws_b = connect_and_identify(app.addr, &token_b).await;
    let ack = request(&mut ws_b, "join-room", 2, serde_json::json!({ "roomId": room_id })).await;
    assert_eq!(ack["success"], true);
}
