//! A worker session: one process, one pipe, one lifecycle.
//!
//! Data flow:
//! ```text
//! worker stdout ─► read_frame ─► WorkerEnd::send ─► pipe ─► client
//! client ─► pipe ─► WorkerEnd::receive ─► write_frame ─► worker stdin
//! ```
//! Either loop failing kills the process; the exit notification releases
//! the worker end and moves the session to `Terminated`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipe::{ClientEnd, MessagePipe, PipeError, WorkerEnd};
use crate::process::{LaunchSpec, ProcessControl, ProcessError, ProcessLauncher, WorkerProcess};

use super::framing;
use super::types::{SessionError, SessionInfo, SessionSpec, SessionState};

struct SessionInner {
    id: String,
    user: String,
    spec: SessionSpec,
    pipe: MessagePipe,
    launcher: Arc<dyn ProcessLauncher>,
    state_tx: watch::Sender<SessionState>,
    started: AtomicBool,
    control: Mutex<Option<Arc<dyn ProcessControl>>>,
    pid: OnceLock<u32>,
    /// Stops the forwarding loops; child of the broker-wide shutdown token.
    cancel: CancellationToken,
}

/// Handle to a worker session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("user", &self.inner.user)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        user: impl Into<String>,
        spec: SessionSpec,
        launcher: Arc<dyn ProcessLauncher>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Starting);
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                user: user.into(),
                spec,
                pipe: MessagePipe::new(),
                launcher,
                state_tx,
                started: AtomicBool::new(false),
                control: Mutex::new(None),
                pid: OnceLock::new(),
                cancel: shutdown.child_token(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn user(&self) -> &str {
        &self.inner.user
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn pipe(&self) -> &MessagePipe {
        &self.inner.pipe
    }

    /// Whether two handles refer to the same session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the session reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Terminated).await;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.inner.id.clone(),
            user: self.inner.user.clone(),
            interpreter: self.inner.spec.interpreter_name.clone(),
            interactive: self.inner.spec.interactive,
            state: self.state(),
            pid: self.inner.pid.get().copied(),
            pipe: self.inner.pipe.stats(),
        }
    }

    /// Move forward to `next`; returns whether the state changed.
    fn transition(&self, next: SessionState) -> bool {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(session_id = %self.inner.id, user = %self.inner.user, state = ?next, "Session state changed");
        }
        changed
    }

    fn launch_spec(&self) -> LaunchSpec {
        let spec = &self.inner.spec;
        let mut args = spec.interpreter.args.clone();
        args.extend([
            "--session-name".to_string(),
            self.inner.id.clone(),
            "--log-dir".to_string(),
            spec.log_dir.to_string_lossy().into_owned(),
            "--log-level".to_string(),
            spec.log_level.clone(),
        ]);
        if spec.interactive {
            args.push("--interactive".to_string());
        }
        args.extend(spec.args.iter().cloned());

        LaunchSpec {
            program: spec.interpreter.path.clone(),
            args,
            working_directory: spec.working_directory.clone(),
            run_as: spec.run_as.clone(),
            env: vec![("KBROKER_SESSION_ID".to_string(), self.inner.id.clone())],
        }
    }

    /// Launch the worker and start forwarding. Can only be called once.
    pub async fn start(&self) -> Result<(), SessionError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyStarted {
                id: self.inner.id.clone(),
            });
        }

        let worker = Arc::new(self.inner.pipe.connect_worker(self.inner.id.clone())?);
        let process = match self.inner.launcher.launch(self.launch_spec()).await {
            Ok(process) => process,
            Err(e) => {
                warn!(session_id = %self.inner.id, error = %e, "Failed to launch worker");
                worker.disconnect();
                self.inner.pipe.close();
                self.transition(SessionState::Terminated);
                return Err(e.into());
            }
        };

        let WorkerProcess {
            pid,
            stdin,
            stdout,
            control,
            exited,
        } = process;
        if let Some(pid) = pid {
            let _ = self.inner.pid.set(pid);
        }
        *self.inner.control.lock() = Some(Arc::clone(&control));

        // Exit handler: release the worker end, then terminate.
        let session = self.clone();
        let exit_worker = Arc::clone(&worker);
        tokio::spawn(async move {
            let code = exited.await.ok().and_then(|status| status.code);
            exit_worker.disconnect();
            session.inner.pipe.close();
            session.inner.cancel.cancel();
            session.transition(SessionState::Terminated);
            info!(session_id = %session.inner.id, ?code, "Worker exited");
        });

        let max_frame = self.inner.spec.max_frame_bytes;
        tokio::spawn(pump_output(
            self.inner.id.clone(),
            stdout,
            Arc::clone(&worker),
            Arc::clone(&control),
            self.inner.cancel.clone(),
            max_frame,
        ));
        tokio::spawn(pump_input(
            self.inner.id.clone(),
            stdin,
            worker,
            Arc::clone(&control),
            self.inner.cancel.clone(),
        ));

        if self.inner.cancel.is_cancelled() {
            // Killed or shut down while launching.
            kill_quietly(&self.inner.id, control.as_ref()).await;
        } else {
            self.transition(SessionState::Running);
        }
        Ok(())
    }

    /// Attach a client to this session's pipe.
    pub fn connect_client(&self) -> Result<ClientEnd, SessionError> {
        Ok(self.inner.pipe.connect_client()?)
    }

    /// Request termination. A worker that already exited counts as success.
    pub async fn kill(&self) -> Result<(), SessionError> {
        let control = self.inner.control.lock().clone();
        let Some(control) = control else {
            debug!(session_id = %self.inner.id, "Killing session that never launched");
            self.inner.cancel.cancel();
            self.inner.pipe.close();
            self.transition(SessionState::Terminated);
            return Ok(());
        };

        match control.kill().await {
            Ok(()) => {
                info!(session_id = %self.inner.id, "Worker killed");
                Ok(())
            }
            Err(ProcessError::AlreadyExited) => {
                debug!(session_id = %self.inner.id, "Worker already exited");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.inner.id, error = %e, "Failed to kill worker");
                Err(e.into())
            }
        }
    }
}

async fn kill_quietly(session_id: &str, control: &dyn ProcessControl) {
    match control.kill().await {
        Ok(()) => debug!(session_id, "Worker killed after forwarding stopped"),
        Err(ProcessError::AlreadyExited) => debug!(session_id, "Worker already exited"),
        Err(e) => warn!(session_id, error = %e, "Failed to kill worker"),
    }
}

/// Worker stdout → pipe.
async fn pump_output(
    session_id: String,
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    worker: Arc<WorkerEnd>,
    control: Arc<dyn ProcessControl>,
    cancel: CancellationToken,
    max_frame: usize,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = framing::read_frame(&mut stdout, max_frame) => frame,
        };
        match frame {
            Ok(Some(bytes)) => worker.send(bytes),
            Ok(None) => {
                debug!(session_id, "Worker closed stdout");
                break;
            }
            Err(e) => {
                warn!(session_id, error = %e, "Failed to read frame from worker");
                break;
            }
        }
    }
    kill_quietly(&session_id, control.as_ref()).await;
}

/// Pipe → worker stdin.
async fn pump_input(
    session_id: String,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    worker: Arc<WorkerEnd>,
    control: Arc<dyn ProcessControl>,
    cancel: CancellationToken,
) {
    loop {
        match worker.receive(&cancel).await {
            Ok(bytes) => {
                if let Err(e) = framing::write_frame(&mut stdin, &bytes).await {
                    warn!(session_id, error = %e, "Failed to write frame to worker");
                    break;
                }
            }
            Err(PipeError::Cancelled) => break,
            Err(e) => {
                debug!(session_id, error = %e, "Worker end stopped receiving");
                break;
            }
        }
    }
    kill_quietly(&session_id, control.as_ref()).await;
}
