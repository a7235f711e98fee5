//! Worker sessions and the per-user session table.
//!
//! A session couples one supervised worker process with one message pipe.
//! The manager owns every session, keyed by user and session id.

pub mod framing;
mod manager;
mod types;
mod worker;

pub use manager::{SessionManager, UserBlock};
pub use types::{CreateSession, SessionError, SessionInfo, SessionSpec, SessionState};
pub use worker::Session;
