//! Transport bridge: a duplex network connection mapped onto a client end.

mod bridge;
mod websocket;

pub use bridge::{BridgeEnd, InboundFrame, TransportError, run_bridge};
pub use websocket::bridge_websocket;
