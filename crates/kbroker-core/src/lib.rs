//! `kbroker` Core Library
//!
//! Shared functionality for `kbroker` components:
//! - Message envelope helpers (id, correlation id, name) that never decode
//!   the payload
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod message;
pub mod tracing_init;

pub use config::BrokerConfig;
pub use error::{Error, Result};
