//! Per-socket driver task
//!
//! Owns the WebSocket stream, writes queued commands and dispatches received
//! frames to the socket's observers.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use super::{Command, WebSocket};
use crate::error::SocketError;
use crate::server::protocol::CloseInfo;

/// Drives a [`WebSocket`] handle once its transport is available
pub struct SocketDriver {
    socket: Arc<WebSocket>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SocketDriver {
    pub(super) fn new(socket: Arc<WebSocket>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self { socket, commands }
    }

    /// The socket this driver serves
    pub fn socket(&self) -> &Arc<WebSocket> {
        &self.socket
    }

    /// Report that the transport never became available
    ///
    /// The error observers see `error`, then the socket closes abnormally.
    /// Open observers never run.
    pub fn fail(self, error: SocketError) {
        self.socket.dispatch_error(&error);
        self.socket.finish(CloseInfo::abnormal());
    }

    /// Open the socket and pump frames until the connection ends
    pub async fn run<S>(self, stream: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Self {
            socket,
            mut commands,
        } = self;

        if !socket.mark_open() {
            debug!(socket = %socket.id(), "socket closed before it opened");
        }

        let (mut sink, mut source) = stream.split();
        let mut peer_close: Option<CloseInfo> = None;

        let info = loop {
            if socket.is_terminating() {
                break CloseInfo::abnormal();
            }
            let deadline = socket.close_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        if let Err(info) = write_frame(&socket, &mut sink, message).await {
                            break info;
                        }
                    }
                    Some(Command::Close(frame)) => {
                        let message = Message::Close(Some(frame));
                        if let Err(info) = write_frame(&socket, &mut sink, message).await {
                            break info;
                        }
                    }
                    Some(Command::Terminate) | None => break CloseInfo::abnormal(),
                },
                frame = source.next() => match frame {
                    Some(Ok(Message::Close(frame))) => {
                        debug!(socket = %socket.id(), "received close frame");
                        let _ = socket.begin_closing();
                        peer_close = Some(CloseInfo::from_frame(frame.as_ref()));
                    }
                    Some(Ok(Message::Pong(payload))) => socket.dispatch_pong(&payload),
                    // Pings are answered by the protocol layer
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(message)) => socket.dispatch_message(&message),
                    Some(Err(e)) => {
                        socket.dispatch_error(&SocketError::Transport(e));
                        break peer_close.take().unwrap_or_else(CloseInfo::abnormal);
                    }
                    None => break peer_close.take().unwrap_or_else(CloseInfo::abnormal),
                },
                _ = close_timer(deadline) => {
                    warn!(socket = %socket.id(), "peer did not answer close frame, dropping transport");
                    break CloseInfo::abnormal();
                }
                _ = socket.interrupted() => {}
            }
        };

        socket.finish(info);
    }
}

/// Write one frame, giving up if the socket is terminated or its close
/// deadline passes while the peer is not reading
async fn write_frame<S>(
    socket: &WebSocket,
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
) -> Result<(), CloseInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let write = sink.send(message);
    tokio::pin!(write);

    loop {
        if socket.is_terminating() {
            debug!(socket = %socket.id(), "write abandoned, socket terminated");
            return Err(CloseInfo::abnormal());
        }
        let deadline = socket.close_deadline();

        tokio::select! {
            result = &mut write => {
                return result.map_err(|e| {
                    error!(socket = %socket.id(), error = %e, "failed to write frame");
                    CloseInfo::abnormal()
                });
            }
            _ = close_timer(deadline) => {
                warn!(socket = %socket.id(), "close deadline passed while writing, dropping transport");
                return Err(CloseInfo::abnormal());
            }
            _ = socket.interrupted() => {}
        }
    }
}

/// Sleep until the close deadline, or forever if none is set
async fn close_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
