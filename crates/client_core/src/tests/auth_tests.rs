use super::*;
use axum::{
    extract::Path,
    http::StatusCode as AxumStatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::domain::TierLevel;
use tokio::net::TcpListener;

fn sample_user(user_id: i64, username: &str) -> UserPayload {
    UserPayload {
        user_id: UserId(user_id),
        username: username.to_string(),
        display: Some("Alice".to_string()),
        avatar_url: None,
        status: UserStatus::Online,
        subscription: Some(shared::domain::SubscriptionInfo {
            tier: TierLevel::Plus,
            expires_at: None,
        }),
        public_key: Some("pk".to_string()),
    }
}

async fn get_user(Path(user_id): Path<i64>) -> Result<Json<UserPayload>, AxumStatusCode> {
    if user_id == 42 {
        Ok(Json(sample_user(42, "a")))
    } else {
        Err(AxumStatusCode::NOT_FOUND)
    }
}

async fn get_user_by_name(
    Path(username): Path<String>,
) -> Result<Json<UserPayload>, AxumStatusCode> {
    match username.as_str() {
        "a" => Ok(Json(sample_user(42, "a"))),
        "locked" => Err(AxumStatusCode::UNAUTHORIZED),
        _ => Err(AxumStatusCode::NOT_FOUND),
    }
}

async fn update_account(Json(change): Json<serde_json::Value>) -> Json<UserPayload> {
    let mut user = sample_user(42, "a");
    if let Some(display) = change.get("display").and_then(|value| value.as_str()) {
        user.display = Some(display.to_string());
    }
    Json(user)
}

async fn issue_token(Path(call_id): Path<String>) -> Result<Json<serde_json::Value>, AxumStatusCode> {
    if call_id == "denied" {
        return Err(AxumStatusCode::FORBIDDEN);
    }
    Ok(Json(json!({ "token": format!("tok-{call_id}") })))
}

async fn spawn_auth_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/users/:id", get(get_user))
        .route("/users/by-name/:name", get(get_user_by_name))
        .route("/account", post(update_account))
        .route("/calls/:id/token", post(issue_token));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn fetches_user_by_id() {
    let base_url = spawn_auth_server().await;
    let client = AuthClient::new(base_url);

    let user = client.get_user(UserId(42)).await.expect("user");
    assert_eq!(user.user_id, UserId(42));
    assert_eq!(user.display.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn missing_user_maps_to_rejected() {
    let base_url = spawn_auth_server().await;
    let client = AuthClient::new(base_url);

    let err = client.get_user(UserId(9)).await.expect_err("must fail");
    match err {
        AuthError::Rejected { status, .. } => assert_eq!(status, StatusCode::NOT_FOUND),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn fetches_user_by_username() {
    let base_url = spawn_auth_server().await;
    let client = AuthClient::new(base_url);

    let user = client.get_user_by_username("a").await.expect("user");
    assert_eq!(user.username, "a");
}

#[tokio::test]
async fn credential_rejection_is_distinguishable() {
    let base_url = spawn_auth_server().await;
    let client = AuthClient::new(base_url);

    let err = client
        .get_user_by_username("locked")
        .await
        .expect_err("must fail");
    match err {
        AuthError::Rejected { status, .. } => assert_eq!(status, StatusCode::UNAUTHORIZED),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn account_change_posts_partial_update() {
    let base_url = spawn_auth_server().await;
    let client = AuthClient::new(base_url);

    let user = client
        .update_account(&AccountChange {
            display: Some("New Name".into()),
            ..AccountChange::default()
        })
        .await
        .expect("update");
    assert_eq!(user.display.as_deref(), Some("New Name"));
}

#[tokio::test]
async fn issues_call_token_bound_to_the_call_id() {
    let base_url = spawn_auth_server().await;
    let client = AuthClient::new(base_url);

    let token = client
        .issue_call_token(&CallId::new("call-123"))
        .await
        .expect("token");
    assert_eq!(token, "tok-call-123");
}

#[tokio::test]
async fn token_denial_surfaces_as_rejected() {
    let base_url = spawn_auth_server().await;
    let client = AuthClient::new(base_url);

    let err = client
        .issue_call_token(&CallId::new("denied"))
        .await
        .expect_err("must fail");
    match err {
        AuthError::Rejected { status, .. } => assert_eq!(status, StatusCode::FORBIDDEN),
        other => panic!("unexpected error: {other:?}"),
    }
}
