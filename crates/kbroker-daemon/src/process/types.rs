//! Process launching types.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// What to launch and how.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Worker host executable.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    /// OS account to run the worker as; `None` runs as the broker's account.
    pub run_as: Option<String>,
    /// Extra environment on top of the forwarded essentials.
    pub env: Vec<(String, String)>,
}

/// Exit information reported once the worker is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, `None` when killed by a signal or when waiting failed.
    pub code: Option<i32>,
}

/// A launched worker: its stdio, a kill switch and an exit notification.
pub struct WorkerProcess {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Arc<dyn ProcessControl>,
    /// Resolves once the process has exited.
    pub exited: oneshot::Receiver<ExitStatus>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Termination handle for a launched worker.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Terminate the process. Returns [`ProcessError::AlreadyExited`] when
    /// it was already gone.
    async fn kill(&self) -> Result<(), ProcessError>;
}

/// Creates worker processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<WorkerProcess, ProcessError>;
}

/// Errors from process operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Unknown OS user: {user}")]
    UserNotFound { user: String },

    #[error("Process already exited")]
    AlreadyExited,

    #[error("Failed to kill worker: {reason}")]
    KillFailed { reason: String },
}
