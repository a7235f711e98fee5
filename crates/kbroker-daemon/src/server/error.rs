use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use crate::pipe::PipeError;
use crate::session::SessionError;

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing caller identity")]
    Unauthenticated,

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Session(e) => match e {
                SessionError::Blocked { .. } => StatusCode::FORBIDDEN,
                SessionError::NoInterpreter { .. } | SessionError::InvalidRequest(_) => {
                    StatusCode::BAD_REQUEST
                }
                SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
                SessionError::AlreadyStarted { .. }
                | SessionError::Pipe(PipeError::AlreadyConnected { .. }) => StatusCode::CONFLICT,
                SessionError::Pipe(PipeError::Disconnected) => StatusCode::GONE,
                SessionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::WorkingDirectory(_)
                | SessionError::Process(_)
                | SessionError::Pipe(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;

    #[test]
    fn session_errors_map_to_status_codes() {
        let cases = [
            (
                SessionError::Blocked { user: "a".into() },
                StatusCode::FORBIDDEN,
            ),
            (
                SessionError::NoInterpreter { selector: None },
                StatusCode::BAD_REQUEST,
            ),
            (
                SessionError::NotFound { id: "x".into() },
                StatusCode::NOT_FOUND,
            ),
            (
                SessionError::Pipe(PipeError::AlreadyConnected { end: "client" }),
                StatusCode::CONFLICT,
            ),
            (
                SessionError::Process(ProcessError::SpawnFailed {
                    reason: "boom".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
    }
}
