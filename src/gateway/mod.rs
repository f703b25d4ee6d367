//! WebSocket upgrade gateway
//!
//! Registers on a shared [`TransportServer`], claims matching upgrade
//! requests, completes the handshake and hands each open connection to the
//! caller at one of three levels:
//!
//! | Entry point | Caller receives |
//! |-------------|-----------------|
//! | [`open_socket`] | the raw [`WebSocket`] handle |
//! | [`open_json_rpc_socket`] | a [`Channel`] |
//! | [`create_server_web_socket_connection`] | a connection built by an [`RpcConnectionFactory`] |
//!
//! Every registration runs its own [`LivenessMonitor`].

mod acceptor;
mod channel;
mod liveness;
mod matcher;
mod rpc;

pub use acceptor::{validate_upgrade, OpenCallback, OpenContext, Registration};
pub use channel::*;
pub use liveness::*;
pub use matcher::*;
pub use rpc::*;

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::error::GatewayError;
use crate::server::{TransportServer, UpgradeRequest};
use crate::socket::{SocketConfig, WebSocket};
use acceptor::Acceptor;

/// Options for one gateway registration
#[derive(Clone)]
pub struct ServerOptions {
    /// Server whose upgrade requests are observed
    pub server: Arc<TransportServer>,
    /// Exact request path to claim
    pub path: Option<String>,
    /// Predicate deciding which requests to claim
    pub matches: Option<MatchFn>,
    /// Liveness probing strategy
    pub liveness: LivenessMode,
    /// Settings applied to every accepted socket
    pub socket: SocketConfig,
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("server", &self.server.local_addr())
            .field("path", &self.path)
            .field("matches", &self.matches.is_some())
            .field("liveness", &self.liveness)
            .field("socket", &self.socket)
            .finish()
    }
}

impl ServerOptions {
    /// Options that claim nothing until a path or predicate is set
    pub fn new(server: Arc<TransportServer>) -> Self {
        Self {
            server,
            path: None,
            matches: None,
            liveness: LivenessMode::default(),
            socket: SocketConfig::default(),
        }
    }

    /// Claim requests for exactly this path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Claim requests accepted by `predicate`
    pub fn with_matches(
        mut self,
        predicate: impl Fn(&UpgradeRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.matches = Some(Arc::new(predicate));
        self
    }

    /// Set the liveness probing strategy
    pub fn with_liveness(mut self, liveness: LivenessMode) -> Self {
        self.liveness = liveness;
        self
    }

    /// Set per-socket settings
    pub fn with_socket_config(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    fn matcher(&self) -> UpgradeMatcher {
        UpgradeMatcher::new(self.path.clone(), self.matches.clone())
    }
}

/// Register for upgrades and receive each opened socket
///
/// `on_open` runs exactly once per successfully opened connection. A
/// connection whose handshake fails never reaches it.
pub fn open_socket(
    options: ServerOptions,
    on_open: impl Fn(Arc<WebSocket>, &OpenContext) + Send + Sync + 'static,
) -> Result<Registration, GatewayError> {
    let monitor = Arc::new(LivenessMonitor::start(options.liveness));
    let acceptor = Acceptor::new(
        options.matcher(),
        Arc::clone(&monitor),
        options.socket.clone(),
        Arc::new(on_open),
    );

    let id = match options.server.add_listener(Arc::new(acceptor)) {
        Ok(id) => id,
        Err(e) => {
            monitor.stop();
            return Err(e);
        }
    };
    info!(
        registration = %id,
        path = ?options.path,
        liveness = ?options.liveness,
        "gateway registered"
    );

    Ok(Registration::new(id, options.server, monitor))
}

/// Register for upgrades and receive each opened socket as a [`Channel`]
pub fn open_json_rpc_socket(
    options: ServerOptions,
    on_open: impl Fn(Arc<dyn Channel>, &OpenContext) + Send + Sync + 'static,
) -> Result<Registration, GatewayError> {
    open_socket(options, move |socket, context| {
        let channel: Arc<dyn Channel> = Arc::new(WebSocketChannel::new(socket));
        on_open(channel, context);
    })
}

/// Register for upgrades and receive an RPC connection per socket
pub fn create_server_web_socket_connection<F>(
    options: ServerOptions,
    factory: F,
    on_connect: impl Fn(F::Connection) + Send + Sync + 'static,
) -> Result<Registration, GatewayError>
where
    F: RpcConnectionFactory,
{
    open_json_rpc_socket(options, move |channel, _| {
        on_connect(factory.create(channel));
    })
}
