//! WebSocket adapter for the transport bridge.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, future};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipe::ClientEnd;

use super::bridge::{BridgeEnd, InboundFrame, run_bridge};

/// Relay between an upgraded WebSocket and a client end.
///
/// Binary messages carry broker messages; text frames are ignored.
pub async fn bridge_websocket(
    socket: WebSocket,
    client: ClientEnd,
    max_message: usize,
    shutdown: CancellationToken,
) -> BridgeEnd {
    let (sink, stream) = socket.split();

    let inbound = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Binary(data)) => Some(Ok(InboundFrame::message(data))),
            Ok(Message::Close(_)) => Some(Ok(InboundFrame::Close)),
            Ok(Message::Text(_)) => {
                debug!("Ignoring text frame on pipe socket");
                None
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(e) => Some(Err(e)),
        })
    });
    let outbound =
        sink.with(|data: Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(data))));

    run_bridge(client, inbound, outbound, max_message, &shutdown).await
}
