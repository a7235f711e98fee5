//! HTTP API over `axum`.
//!
//! Routes:
//! - `GET /health`
//! - `GET /sessions`
//! - `PUT /sessions/{id}` / `DELETE /sessions/{id}`
//! - `GET /sessions/{id}/pipe` (WebSocket)
//!
//! Authentication happens in front of the broker; the authenticated user
//! arrives in the [`USER_HEADER`] header.

mod error;
mod routes;

pub use error::ApiError;
pub use routes::{AppState, USER_HEADER, build_router};
