//! Message pipe: the in-process relay between one worker and one client.
//!
//! A pipe exposes two single-owner ends. The worker end is connected once
//! for the lifetime of the pipe; the client end can be released and
//! reconnected any number of times. Requests the worker sent that were not
//! answered when a client went away are replayed to the next client.

mod relay;
mod types;

pub use relay::{ClientEnd, MessagePipe, WorkerEnd};
pub use types::{PipeError, PipeMessage, PipeStats};
