//! Worker launcher backed by `tokio::process`.
//!
//! Spawns the worker host with piped stdio, logs its stderr, and keeps the
//! `Child` inside a supervisor task that reports the exit and services kill
//! requests.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::types::{
    ExitStatus, LaunchSpec, ProcessControl, ProcessError, ProcessLauncher, WorkerProcess,
};

type KillReply = oneshot::Sender<Result<(), ProcessError>>;

/// Launches workers as child processes of the broker.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    /// Timeout for graceful termination before SIGKILL.
    terminate_timeout: Duration,
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl CommandLauncher {
    pub const fn new(terminate_timeout: Duration) -> Self {
        Self { terminate_timeout }
    }

    fn build_command(spec: &LaunchSpec) -> Result<Command, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.current_dir(&spec.working_directory)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Ensure essential env vars are available to the worker even
        // when running under systemd with stripped environment.
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", &home);
        }
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", &path);
        }

        if let Some(user) = &spec.run_as {
            impersonate(&mut cmd, user)?;
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}

#[cfg(unix)]
fn impersonate(cmd: &mut Command, user: &str) -> Result<(), ProcessError> {
    let account = nix::unistd::User::from_name(user)
        .map_err(|e| ProcessError::SpawnFailed {
            reason: format!("user lookup for {user} failed: {e}"),
        })?
        .ok_or_else(|| ProcessError::UserNotFound {
            user: user.to_string(),
        })?;
    cmd.uid(account.uid.as_raw())
        .gid(account.gid.as_raw())
        .env("HOME", &account.dir)
        .env("USER", &account.name);
    Ok(())
}

#[cfg(not(unix))]
fn impersonate(_cmd: &mut Command, user: &str) -> Result<(), ProcessError> {
    Err(ProcessError::SpawnFailed {
        reason: format!("running workers as {user} is not supported on this platform"),
    })
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<WorkerProcess, ProcessError> {
        let mut cmd = Self::build_command(&spec)?;

        info!(
            program = %spec.program.display(),
            working_dir = %spec.working_directory.display(),
            run_as = ?spec.run_as,
            "Spawning worker process"
        );
        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| ProcessError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        // Set up stderr reader for diagnostics
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pid, "stderr: {}", line);
                }
                debug!(pid, "stderr reader finished");
            });
        }

        let (kill_tx, kill_rx) = mpsc::channel::<KillReply>(4);
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            pid,
            kill_rx,
            exit_tx,
            self.terminate_timeout,
        ));

        Ok(WorkerProcess {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            control: Arc::new(ChildControl { kill_tx }),
            exited: exit_rx,
        })
    }
}

/// Owns the child until it exits.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    mut kill_rx: mpsc::Receiver<KillReply>,
    exit_tx: oneshot::Sender<ExitStatus>,
    terminate_timeout: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Some(reply) = kill_rx.recv() => {
            let status = terminate(&mut child, pid, terminate_timeout).await;
            let result = status
                .as_ref()
                .map(|_| ())
                .map_err(|e| ProcessError::KillFailed { reason: e.to_string() });
            let _ = reply.send(result);
            status
        }
    };
    // Pending and future kill requests now observe `AlreadyExited`.
    drop(kill_rx);

    let code = match status {
        Ok(status) => {
            info!(pid, ?status, "Worker process exited");
            status.code()
        }
        Err(e) => {
            warn!(pid, error = %e, "Error waiting for worker process");
            None
        }
    };
    let _ = exit_tx.send(ExitStatus { code });
}

/// Try a graceful shutdown first, then kill after the timeout.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    terminate_timeout: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{Signal, kill};
        if let Err(e) = kill(nix::unistd::Pid::from_raw(raw), Signal::SIGTERM) {
            warn!(pid = raw, error = %e, "Failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(terminate_timeout, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(pid, "Timeout waiting for graceful shutdown, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

struct ChildControl {
    kill_tx: mpsc::Sender<KillReply>,
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn kill(&self) -> Result<(), ProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.kill_tx.send(reply_tx).await.is_err() {
            return Err(ProcessError::AlreadyExited);
        }
        reply_rx.await.unwrap_or(Err(ProcessError::AlreadyExited))
    }
}
