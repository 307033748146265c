mod common;

use serde_json::json;

use common::TestClient;

#[tokio::test]
async fn register_login_and_connect_flow() {
    let (addr, _state, _store) = common::start_server().await;
    let client = reqwest::Client::new();

    // Register.
    let response = client
        .post(format!("http://{addr}/api/v1/auth/register"))
        .json(&json!({
            "username": "alice",
            "display_name": "Alice",
            "password": "a perfectly long password"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["access_token"].as_str().unwrap().starts_with("act_"));
    assert_eq!(body["user"]["username"], "alice");
    assert!(body["user"].get("password_hash").is_none());

    // Wrong password.
    let response = client
        .post(format!("http://{addr}/api/v1/auth/login"))
        .json(&json!({ "username": "alice", "password": "wrong password!!" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // Correct password.
    let response = client
        .post(format!("http://{addr}/api/v1/auth/login"))
        .json(&json!({ "username": "alice", "password": "a perfectly long password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let token = body["access_token"].as_str().unwrap().to_string();

    // The minted token upgrades into the hub.
    let mut ws = TestClient::connect(addr, &token).await;
    ws.expect_silence(std::time::Duration::from_millis(300)).await;
}

#[tokio::test]
async fn register_validates_input() {
    let (addr, _state, _store) = common::start_server().await;
    let client = reqwest::Client::new();

    // Username too short, password too short.
    let response = client
        .post(format!("http://{addr}/api/v1/auth/register"))
        .json(&json!({
            "username": "a",
            "display_name": "A",
            "password": "short"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(body["error"]["details"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn duplicate_username_conflicts() {
    let (addr, _state, _store) = common::start_server().await;
    let client = reqwest::Client::new();

    for expected_status in [201, 409] {
        let response = client
            .post(format!("http://{addr}/api/v1/auth/register"))
            .json(&json!({
                "username": "taken",
                "display_name": "Taken",
                "password": "a perfectly long password"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), expected_status);
    }
}

#[tokio::test]
async fn rest_requires_bearer_token() {
    let (addr, state, _store) = common::start_server().await;
    let (alice, _token) = common::seed_user(&state, "alice").await;
    let chat = common::seed_chat(&state, courier_api::models::chat::kind::GROUP, &[&alice]).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/v1/chats/{}/messages", chat.id))
        .json(&json!({ "content": "no token" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}
