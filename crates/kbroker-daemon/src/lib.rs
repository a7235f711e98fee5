//! kbroker daemon library
//!
//! Supervises interpreter worker processes and relays binary messages
//! between each worker and a client that may reconnect:
//! - Message pipe with request replay across client reconnects
//! - Worker process launching and supervision
//! - Per-user session table with blocking and replacement
//! - Transport bridge from network connections onto a pipe
//! - HTTP/WebSocket API

pub mod pipe;
pub mod process;
pub mod server;
pub mod session;
pub mod transport;
