#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! HTTP API tests driven through `tower::ServiceExt::oneshot`.

mod support;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use kbroker_daemon::server::{AppState, USER_HEADER, build_router};
use kbroker_daemon::session::SessionManager;

use support::{FakeLauncher, FakeWorker, test_config};

struct TestApp {
    _dir: tempfile::TempDir,
    manager: SessionManager,
    launcher: std::sync::Arc<FakeLauncher>,
    _workers: tokio::sync::mpsc::UnboundedReceiver<FakeWorker>,
}

fn app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, workers) = FakeLauncher::new();
    let manager = SessionManager::new(test_config(dir.path()), launcher.clone());
    TestApp {
        _dir: dir,
        manager,
        launcher,
        _workers: workers,
    }
}

impl TestApp {
    /// Send a request and return (status, JSON body or `Null`).
    async fn send(
        &self,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let router = build_router(AppState {
            manager: self.manager.clone(),
        });
        let resp = router.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(&self, user: &str, id: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::PUT, &format!("/sessions/{id}"), Some(user), Some(body))
            .await
    }
}

#[tokio::test]
async fn health_reports_counts() {
    let app = app();
    let (status, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);

    app.create("alice", "s1", json!({})).await;
    let (_, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["users"], 1);
}

#[tokio::test]
async fn create_returns_session_descriptor() {
    let app = app();
    let (status, body) = app
        .create(
            "alice",
            "s1",
            json!({"interpreter": "python", "args": ["--x"], "interactive": true}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "s1");
    assert_eq!(body["user"], "alice");
    assert_eq!(body["interpreter"], "python");
    assert_eq!(body["interactive"], true);
    assert_eq!(body["state"], "running");
    assert_eq!(body["pipe"]["client_connected"], false);
}

#[tokio::test]
async fn list_shows_only_callers_sessions() {
    let app = app();
    app.create("alice", "a1", json!({})).await;
    app.create("alice", "a2", json!({})).await;
    app.create("bob", "b1", json!({})).await;

    let (status, body) = app.send(Method::GET, "/sessions", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["a1", "a2"]);
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let app = app();
    let (status, _) = app.send(Method::GET, "/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .send(Method::PUT, "/sessions/s1", Some("  "), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("identity"));
}

#[tokio::test]
async fn unknown_interpreter_is_bad_request() {
    let app = app();
    let (status, _) = app
        .create("alice", "s1", json!({"interpreter": "julia"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn blocked_user_is_forbidden() {
    let app = app();
    let _guard = app.manager.block_user("alice", true).await;
    let (status, _) = app.create("alice", "s1", json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn launch_failure_is_server_error() {
    let app = app();
    app.launcher.fail_launches(true);
    let (status, body) = app.create("alice", "s1", json!({})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("launch disabled"));
}

#[tokio::test]
async fn delete_session() {
    let app = app();
    app.create("alice", "s1", json!({})).await;

    let (status, _) = app
        .send(Method::DELETE, "/sessions/s1", Some("bob"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .send(Method::DELETE, "/sessions/s1", Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
    assert_eq!(app.manager.session_count(), 0);
}

#[tokio::test]
async fn pipe_requires_websocket_upgrade() {
    let app = app();
    app.create("alice", "s1", json!({})).await;
    let (status, _) = app
        .send(Method::GET, "/sessions/s1/pipe", Some("alice"), None)
        .await;
    assert!(status.is_client_error());
    // The rejected request did not claim the client end.
    let session = app.manager.get(Some("alice"), "s1").unwrap();
    assert!(!session.pipe().is_client_connected());
}
