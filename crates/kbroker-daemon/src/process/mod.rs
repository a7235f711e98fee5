//! Worker process launching and supervision.

mod launcher;
mod types;

pub use launcher::CommandLauncher;
pub use types::{
    ExitStatus, LaunchSpec, ProcessControl, ProcessError, ProcessLauncher, WorkerProcess,
};
