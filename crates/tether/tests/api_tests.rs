//! API integration tests over the axum router.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use tether::api::{AppState, create_router};

mod common;
use common::{RUNNER_TOKEN, test_env};

fn router(env: &common::TestEnv) -> axum::Router {
    create_router(AppState::new(env.registry.clone()))
}

fn start_body() -> String {
    json!({
        "userId": common::OWNER,
        "workspace": "/workspace",
        "runnerToken": RUNNER_TOKEN,
        "sandboxId": "sb-http",
        "tunnels": {},
    })
    .to_string()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_start_then_status() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-1/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(start_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "running");
    assert_eq!(json["sandboxId"], "sb-http");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/http-1/status")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["sessionId"], "http-1");
    assert_eq!(json["runnerConnected"], false);
}

#[tokio::test]
async fn test_start_requires_user_id() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/http-2/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "userId": "",
                        "workspace": "/w",
                        "runnerToken": "t",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "malformed_request");
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/nope/status")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prompt_and_messages() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-3/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(start_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-3/prompt")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "content": "do the thing" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["messageId"].is_string());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/http-3/messages?limit=10")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "do the thing");
    assert_eq!(messages[0]["role"], "user");
}

#[tokio::test]
async fn test_prompt_requires_content() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-4/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(start_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/http-4/prompt")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "content": "" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_update_requires_fields() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-5/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(start_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-5/webhook-update")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/http-5/webhook-update")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "branch": "feat-y", "commitCount": 4 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let git = env.directory.git_state("http-5").unwrap();
    assert_eq!(git.branch.as_deref(), Some("feat-y"));
    assert_eq!(git.commit_count, Some(4));
}

#[tokio::test]
async fn test_gc_removes_session() {
    let env = test_env();
    let app = router(&env);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-6/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(start_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/http-6/gc")
                .method(Method::POST)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/http-6/status")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
