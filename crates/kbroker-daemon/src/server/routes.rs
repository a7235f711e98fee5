use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, info};

use crate::session::{CreateSession, SessionError, SessionInfo, SessionManager};
use crate::transport::bridge_websocket;

use super::error::ApiError;

/// Header carrying the authenticated user name.
pub const USER_HEADER: &str = "x-kbroker-user";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", put(create_session).delete(delete_session))
        .route("/sessions/{id}/pipe", get(connect_pipe))
        .with_state(state)
}

fn caller(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
}

fn require_caller(headers: &HeaderMap) -> Result<String, ApiError> {
    caller(headers).ok_or(ApiError::Unauthenticated)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    sessions: usize,
    users: usize,
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        sessions: state.manager.session_count(),
        users: state.manager.list_users().len(),
    })
}

/// `GET /sessions`: the caller's sessions.
async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    let user = require_caller(&headers)?;
    let sessions = state
        .manager
        .list_by_user(&user)
        .iter()
        .map(|s| s.info())
        .collect();
    Ok(Json(sessions))
}

/// `PUT /sessions/{id}`: create or replace a session.
async fn create_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateSession>,
) -> Result<Json<SessionInfo>, ApiError> {
    let user = require_caller(&headers)?;
    let session = state.manager.create(&user, &id, request).await?;
    Ok(Json(session.info()))
}

/// `DELETE /sessions/{id}`
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = require_caller(&headers)?;
    state.manager.delete(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /sessions/{id}/pipe`: attach as the session's client.
///
/// Anonymous callers match on session id alone.
async fn connect_pipe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user = caller(&headers);
    let session = state
        .manager
        .get(user.as_deref(), &id)
        .ok_or_else(|| SessionError::NotFound { id: id.clone() })?;
    let client = session.connect_client()?;

    let max_message = state.manager.config().sessions.max_frame_bytes;
    let shutdown = state.manager.shutdown_token().clone();
    info!(session_id = %id, user = ?user, "Client attaching to session");
    Ok(ws
        .max_message_size(max_message)
        .on_upgrade(move |socket| async move {
            let end = bridge_websocket(socket, client, max_message, shutdown).await;
            debug!(session_id = %id, ?end, "Client detached from session");
        }))
}
