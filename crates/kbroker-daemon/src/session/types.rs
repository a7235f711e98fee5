//! Session types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use kbroker_core::config::InterpreterConfig;

use crate::pipe::{PipeError, PipeStats};
use crate::process::ProcessError;

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Terminated,
}

/// Parameters a client supplies when creating a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSession {
    /// Interpreter name; the configured default when absent.
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Extra worker arguments appended after the broker's own.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub interactive: bool,
}

/// Resolved launch settings for one session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub interpreter_name: String,
    pub interpreter: InterpreterConfig,
    pub args: Vec<String>,
    pub interactive: bool,
    pub working_directory: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub run_as: Option<String>,
    pub max_frame_bytes: usize,
}

/// Serializable session descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub user: String,
    pub interpreter: String,
    pub interactive: bool,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub pipe: PipeStats,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session already started: {id}")]
    AlreadyStarted { id: String },

    #[error("User is blocked: {user}")]
    Blocked { user: String },

    #[error("No interpreter matches {selector:?}")]
    NoInterpreter { selector: Option<String> },

    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Invalid session request: {0}")]
    InvalidRequest(String),

    #[error("Broker is shutting down")]
    ShuttingDown,

    #[error("Failed to prepare working directory: {0}")]
    WorkingDirectory(#[from] std::io::Error),

    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}
