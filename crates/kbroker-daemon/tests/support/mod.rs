//! In-memory worker processes for integration tests.
//!
//! `FakeLauncher` hands the broker duplex streams instead of real pipes and
//! passes the other halves to the test as `FakeWorker`s.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

use kbroker_core::BrokerConfig;
use kbroker_core::config::InterpreterConfig;
use kbroker_daemon::process::{
    ExitStatus, LaunchSpec, ProcessControl, ProcessError, ProcessLauncher, WorkerProcess,
};
use kbroker_daemon::session::framing;

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Broker config with one `python` interpreter rooted in `dir`.
pub fn test_config(dir: &Path) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.interpreters.insert(
        "python".to_string(),
        InterpreterConfig {
            path: "/usr/bin/python3".into(),
            args: vec!["-m".to_string(), "kernel_host".to_string()],
        },
    );
    config.default_interpreter = Some("python".to_string());
    config.sessions.working_root = dir.join("sessions");
    config.sessions.log_dir = dir.join("logs");
    config.sessions.max_frame_bytes = 1024 * 1024;
    config
}

struct ExitState {
    exit_tx: Mutex<Option<oneshot::Sender<ExitStatus>>>,
    kills: AtomicUsize,
}

impl ExitState {
    fn exit(&self, code: Option<i32>) -> bool {
        match self.exit_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(ExitStatus { code });
                true
            }
            None => false,
        }
    }
}

struct FakeControl {
    state: Arc<ExitState>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn kill(&self) -> Result<(), ProcessError> {
        if self.state.exit(None) {
            self.state.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(ProcessError::AlreadyExited)
        }
    }
}

/// Launcher producing in-memory workers.
pub struct FakeLauncher {
    workers: mpsc::UnboundedSender<FakeWorker>,
    fail: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (workers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                workers,
                fail: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Make subsequent launches fail to spawn.
    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<WorkerProcess, ProcessError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProcessError::SpawnFailed {
                reason: "launch disabled".to_string(),
            });
        }
        let (broker_stdin, worker_stdin) = tokio::io::duplex(64 * 1024);
        let (worker_stdout, broker_stdout) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exited) = oneshot::channel();
        let state = Arc::new(ExitState {
            exit_tx: Mutex::new(Some(exit_tx)),
            kills: AtomicUsize::new(0),
        });

        let _ = self.workers.send(FakeWorker {
            spec,
            stdin: worker_stdin,
            stdout: worker_stdout,
            state: Arc::clone(&state),
        });
        Ok(WorkerProcess {
            pid: Some(4242),
            stdin: Box::new(broker_stdin),
            stdout: Box::new(broker_stdout),
            control: Arc::new(FakeControl { state }),
            exited,
        })
    }
}

/// The worker side of a fake process.
pub struct FakeWorker {
    pub spec: LaunchSpec,
    stdin: DuplexStream,
    stdout: DuplexStream,
    state: Arc<ExitState>,
}

impl FakeWorker {
    /// Write one framed message to the broker.
    pub async fn send(&mut self, message: &[u8]) {
        framing::write_frame(&mut self.stdout, message).await.unwrap();
    }

    /// Read the next framed message from the broker.
    pub async fn recv(&mut self) -> Bytes {
        tokio::time::timeout(TIMEOUT, framing::read_frame(&mut self.stdin, 1024 * 1024))
            .await
            .expect("worker receive timed out")
            .unwrap()
            .expect("broker closed worker stdin")
    }

    /// Simulate the process exiting on its own.
    pub fn exit(&self, code: i32) {
        self.state.exit(Some(code));
    }

    pub fn kill_count(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.state.exit_tx.lock().is_none()
    }
}

/// Wait for the next launched worker.
pub async fn next_worker(rx: &mut mpsc::UnboundedReceiver<FakeWorker>) -> FakeWorker {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("no worker launched")
        .expect("launcher dropped")
}
