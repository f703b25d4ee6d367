//! Shared HTTP transport server
//!
//! Listens on a TCP port, reads each request head and offers upgrade requests
//! to the registered [`UpgradeListener`]s in registration order. Several
//! gateway registrations can share one server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{PendingUpgrade, UpgradeListener};
use super::request::{read_head, RequestError};
use crate::error::GatewayError;

/// Settings for the transport server
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time allowed for a client to send its request head
    pub head_timeout: Duration,
    /// Largest request head accepted
    pub max_head_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            head_timeout: Duration::from_secs(10),
            max_head_bytes: 16 * 1024,
        }
    }
}

type Listeners = Vec<(Uuid, Arc<dyn UpgradeListener>)>;

/// HTTP server that hands upgrade requests to listeners
pub struct TransportServer {
    config: TransportConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    listeners: RwLock<Listeners>,
    shutdown_tx: broadcast::Sender<()>,
    shut_down: AtomicBool,
}

impl TransportServer {
    /// Bind a new transport server
    pub async fn bind(addr: &str, config: TransportConfig) -> Result<Arc<Self>, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            config,
            listener,
            local_addr,
            listeners: RwLock::new(Vec::new()),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register an upgrade listener
    pub fn add_listener(&self, listener: Arc<dyn UpgradeListener>) -> Result<Uuid, GatewayError> {
        if self.is_shut_down() {
            return Err(GatewayError::ServerShutDown);
        }
        let id = Uuid::new_v4();
        self.listeners.write().push((id, listener));
        debug!(listener = %id, "upgrade listener registered");
        Ok(id)
    }

    /// Remove an upgrade listener; returns whether it was registered
    pub fn remove_listener(&self, id: Uuid) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        before != listeners.len()
    }

    /// Number of registered upgrade listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Accept connections until shutdown
    pub async fn run(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.is_shut_down() {
            return Err(GatewayError::ServerShutDown);
        }
        info!("Transport server listening on {}", self.local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping transport server");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read one request head and route it
    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        debug!("New connection from {}", peer_addr);

        let (request, head) =
            match read_head(&mut stream, self.config.max_head_bytes, self.config.head_timeout)
                .await
            {
                Ok(parsed) => parsed,
                Err(RequestError::TooLarge { max_bytes }) => {
                    warn!("Request head from {} exceeds {} bytes", peer_addr, max_bytes);
                    reject(&mut stream, "431 Request Header Fields Too Large").await;
                    return;
                }
                Err(RequestError::Parse(e)) => {
                    warn!("Malformed request from {}: {}", peer_addr, e);
                    reject(&mut stream, "400 Bad Request").await;
                    return;
                }
                Err(RequestError::InvalidHeader(name)) => {
                    warn!("Invalid header {} from {}", name, peer_addr);
                    reject(&mut stream, "400 Bad Request").await;
                    return;
                }
                Err(e) => {
                    debug!("Dropping connection from {}: {}", peer_addr, e);
                    return;
                }
            };
        let request = request.with_peer_addr(peer_addr);

        if !request.is_upgrade() {
            debug!("Plain HTTP request from {} for {}", peer_addr, request.target());
            reject(&mut stream, "426 Upgrade Required").await;
            return;
        }

        let upgrade = PendingUpgrade {
            request,
            stream,
            head,
        };
        if let Some(mut unclaimed) = self.dispatch(upgrade) {
            debug!(
                "No listener claimed upgrade from {} for {}",
                peer_addr,
                unclaimed.request.target()
            );
            reject(&mut unclaimed.stream, "404 Not Found").await;
        }
    }

    /// Offer an upgrade to each listener until one claims it
    ///
    /// Iterates a snapshot, so listeners may register or unregister while an
    /// upgrade is being offered.
    pub fn dispatch(&self, upgrade: PendingUpgrade) -> Option<PendingUpgrade> {
        let listeners: Vec<Arc<dyn UpgradeListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut pending = upgrade;
        for listener in listeners {
            pending = listener.on_upgrade(pending)?;
        }
        Some(pending)
    }
}

/// Answer with a bodyless status and close the connection
pub(crate) async fn reject(stream: &mut TcpStream, status: &str) {
    let response = format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to write {} response: {}", status, e);
        return;
    }
    let _ = stream.shutdown().await;
}
