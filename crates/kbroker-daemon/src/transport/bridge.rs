//! Pipe ↔ socket forwarding.
//!
//! Two loops run concurrently: network → pipe and pipe → network. The
//! first one to finish decides the shutdown: a relay-side disconnect closes
//! the socket gracefully, a network-side closure cancels the relay loop.

use std::fmt::Display;

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipe::{ClientEnd, PipeError};

/// One inbound unit from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Payload fragment; `end_of_message` marks the last one of a message.
    Data {
        payload: Bytes,
        end_of_message: bool,
    },
    /// Peer started closing the connection.
    Close,
}

impl InboundFrame {
    /// A complete single-fragment message.
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self::Data {
            payload: payload.into(),
            end_of_message: true,
        }
    }
}

/// Why a bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The worker went away; the socket was closed gracefully.
    RelayDisconnected,
    /// The peer closed or dropped the connection.
    NetworkClosed,
    /// The peer violated the framing protocol.
    ProtocolError,
    /// The broker is shutting down.
    Shutdown,
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Inbound message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),
}

enum Finished {
    Relay(TransportError),
    Network(Result<(), TransportError>),
}

/// Bridge `client` onto a split duplex connection until either side ends.
///
/// The client end is released when this returns.
pub async fn run_bridge<R, E, W>(
    client: ClientEnd,
    mut inbound: R,
    mut outbound: W,
    max_message: usize,
    shutdown: &CancellationToken,
) -> BridgeEnd
where
    R: Stream<Item = Result<InboundFrame, E>> + Unpin,
    E: Display,
    W: Sink<Bytes> + Unpin,
    W::Error: Display,
{
    let relay_cancel = shutdown.child_token();
    let finished = {
        let relay = forward_to_network(&client, &mut outbound, &relay_cancel);
        let network = forward_to_pipe(&client, &mut inbound, max_message);
        tokio::select! {
            err = relay => Finished::Relay(err),
            result = network => Finished::Network(result),
        }
    };
    relay_cancel.cancel();

    let end = match finished {
        Finished::Relay(TransportError::Pipe(PipeError::Cancelled)) => BridgeEnd::Shutdown,
        Finished::Relay(TransportError::Pipe(PipeError::Disconnected))
        | Finished::Network(Err(TransportError::Pipe(PipeError::Disconnected))) => {
            BridgeEnd::RelayDisconnected
        }
        Finished::Relay(err) => {
            debug!(error = %err, "Outbound side stopped");
            BridgeEnd::NetworkClosed
        }
        Finished::Network(Ok(())) => BridgeEnd::NetworkClosed,
        Finished::Network(Err(TransportError::Socket(reason))) => {
            debug!(%reason, "Inbound side failed");
            BridgeEnd::NetworkClosed
        }
        Finished::Network(Err(err)) => {
            warn!(error = %err, "Closing connection after protocol error");
            BridgeEnd::ProtocolError
        }
    };

    if end != BridgeEnd::NetworkClosed
        && let Err(e) = outbound.close().await
    {
        warn!(error = %e, "Failed to close connection gracefully");
    }
    info!(?end, "Transport bridge finished");
    end
}

/// Pipe → network. Only returns on failure.
async fn forward_to_network<W>(
    client: &ClientEnd,
    outbound: &mut W,
    cancel: &CancellationToken,
) -> TransportError
where
    W: Sink<Bytes> + Unpin,
    W::Error: Display,
{
    loop {
        let message = match client.receive(cancel).await {
            Ok(message) => message,
            Err(e) => return e.into(),
        };
        if message.replayed {
            debug!(len = message.bytes.len(), "Replaying message to client");
        }
        if let Err(e) = outbound.send(message.bytes).await {
            return TransportError::Socket(e.to_string());
        }
    }
}

/// Network → pipe, reassembling fragments into whole messages.
async fn forward_to_pipe<R, E>(
    client: &ClientEnd,
    inbound: &mut R,
    max_message: usize,
) -> Result<(), TransportError>
where
    R: Stream<Item = Result<InboundFrame, E>> + Unpin,
    E: Display,
{
    let mut buffer = BytesMut::new();
    while let Some(frame) = inbound.next().await {
        match frame.map_err(|e| TransportError::Socket(e.to_string()))? {
            InboundFrame::Close => return Ok(()),
            InboundFrame::Data {
                payload,
                end_of_message,
            } => {
                if buffer.len() + payload.len() > max_message {
                    return Err(TransportError::MessageTooLarge { max: max_message });
                }
                buffer.extend_from_slice(&payload);
                if end_of_message {
                    client.send(buffer.split().freeze())?;
                }
            }
        }
    }
    Ok(())
}
