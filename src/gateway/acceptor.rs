//! Handshake acceptor
//!
//! Claims matching upgrade requests from the transport server, completes the
//! WebSocket handshake and hands the open socket to the registration's
//! callback.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::liveness::LivenessMonitor;
use super::matcher::UpgradeMatcher;
use crate::error::{HandshakeError, SocketError};
use crate::server::protocol::CLOSE_GOING_AWAY;
use crate::server::{reject, PendingUpgrade, TransportServer, UpgradeListener, UpgradeRequest};
use crate::socket::{SocketConfig, WebSocket};

/// The only WebSocket protocol version accepted
const WEBSOCKET_VERSION: &str = "13";

/// Callback invoked once per opened socket
pub type OpenCallback = Arc<dyn Fn(Arc<WebSocket>, &OpenContext) + Send + Sync>;

/// What the client sent while opening a socket
#[derive(Debug, Clone)]
pub struct OpenContext {
    /// The upgrade request
    pub request: UpgradeRequest,
    /// Bytes received after the request head, replayed into the socket
    pub head: Bytes,
}

/// Check the upgrade headers and return the client's handshake key
pub fn validate_upgrade(request: &UpgradeRequest) -> Result<String, HandshakeError> {
    if !request.method().eq_ignore_ascii_case("GET") {
        return Err(HandshakeError::Method(request.method().to_string()));
    }

    let upgrade = request
        .header("upgrade")
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::InvalidHeader("Upgrade"));
    }

    let connection = request
        .header("connection")
        .ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::InvalidHeader("Connection"));
    }

    let version = request
        .header("sec-websocket-version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version.trim() != WEBSOCKET_VERSION {
        return Err(HandshakeError::InvalidHeader("Sec-WebSocket-Version"));
    }

    let key = request
        .header("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

    Ok(key.to_string())
}

/// Write the `101` response and wrap the stream
async fn accept(
    mut stream: TcpStream,
    key: &str,
    head: Bytes,
) -> Result<WebSocketStream<TcpStream>, HandshakeError> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(WebSocketStream::from_partially_read(stream, head.to_vec(), Role::Server, None).await)
}

/// Upgrade listener for one registration
pub(crate) struct Acceptor {
    matcher: UpgradeMatcher,
    monitor: Arc<LivenessMonitor>,
    socket_config: SocketConfig,
    on_open: OpenCallback,
}

impl Acceptor {
    pub(crate) fn new(
        matcher: UpgradeMatcher,
        monitor: Arc<LivenessMonitor>,
        socket_config: SocketConfig,
        on_open: OpenCallback,
    ) -> Self {
        Self {
            matcher,
            monitor,
            socket_config,
            on_open,
        }
    }
}

impl UpgradeListener for Acceptor {
    fn on_upgrade(&self, upgrade: PendingUpgrade) -> Option<PendingUpgrade> {
        if !self.matcher.claims(&upgrade.request) {
            return Some(upgrade);
        }

        let PendingUpgrade {
            request,
            mut stream,
            head,
        } = upgrade;

        let key = match validate_upgrade(&request) {
            Ok(key) => key,
            Err(e) => {
                warn!("Rejecting upgrade for {}: {}", request.target(), e);
                tokio::spawn(async move {
                    reject(&mut stream, "400 Bad Request").await;
                });
                return None;
            }
        };

        let (socket, driver) =
            WebSocket::with_peer_addr(self.socket_config.clone(), request.peer_addr());
        debug!(socket = %socket.id(), target = request.target(), "upgrade claimed");

        let context = OpenContext {
            request,
            head: head.clone(),
        };
        let monitor = Arc::clone(&self.monitor);
        let on_open = Arc::clone(&self.on_open);
        socket.once_open(move |socket| {
            monitor.track(socket);
            info!(
                socket = %socket.id(),
                peer = ?socket.peer_addr(),
                "WebSocket opened on {}",
                context.request.target()
            );
            on_open(Arc::clone(socket), &context);
        });

        tokio::spawn(async move {
            match accept(stream, &key, head).await {
                Ok(ws) => driver.run(ws).await,
                Err(e) => {
                    warn!(socket = %driver.socket().id(), error = %e, "handshake failed");
                    let error = match e {
                        HandshakeError::Io(io) => SocketError::Transport(io.into()),
                        _ => SocketError::Disconnected,
                    };
                    driver.fail(error);
                }
            }
        });

        None
    }
}

/// A live gateway registration on a transport server
///
/// Dropping the registration unregisters it, stops its liveness monitor and
/// closes its connections.
pub struct Registration {
    id: Uuid,
    server: Arc<TransportServer>,
    monitor: Arc<LivenessMonitor>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("mode", &self.monitor.mode())
            .field("clients", &self.client_count())
            .finish()
    }
}

impl Registration {
    pub(crate) fn new(id: Uuid, server: Arc<TransportServer>, monitor: Arc<LivenessMonitor>) -> Self {
        Self {
            id,
            server,
            monitor,
        }
    }

    /// Listener id on the transport server
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of currently open connections
    pub fn client_count(&self) -> usize {
        self.monitor.connection_count()
    }

    /// Snapshot of the currently open connections
    pub fn clients(&self) -> Vec<Arc<WebSocket>> {
        self.monitor.connections()
    }

    /// Unregister, stop monitoring and close every open connection
    pub fn close(&self) {
        if !self.server.remove_listener(self.id) {
            return;
        }
        self.monitor.stop();
        for socket in self.monitor.connections() {
            socket.close(CLOSE_GOING_AWAY, "gateway closed");
        }
        debug!(registration = %self.id, "registration closed");
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.close();
    }
}
