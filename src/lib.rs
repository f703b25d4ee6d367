//! WebSocket upgrade gateway
//!
//! Intercepts HTTP upgrade requests on a shared transport server, completes
//! the WebSocket handshake, wraps each socket in a message [`Channel`] for
//! RPC code and keeps connections alive (or reclaims them) with a heartbeat.
//!
//! ```rust,no_run
//! use wsgate::gateway::{open_json_rpc_socket, Channel, ServerOptions};
//! use wsgate::server::{TransportConfig, TransportServer};
//!
//! # async fn example() -> Result<(), wsgate::GatewayError> {
//! let server = TransportServer::bind("127.0.0.1:9000", TransportConfig::default()).await?;
//! let _registration = open_json_rpc_socket(
//!     ServerOptions::new(server.clone()).with_path("/services"),
//!     |channel, _context| {
//!         let reply = channel.clone();
//!         channel.on_message(Box::new(move |text: &str| reply.send(text)));
//!     },
//! )?;
//! server.run().await
//! # }
//! ```
//!
//! [`Channel`]: gateway::Channel

pub mod config;
pub mod error;
pub mod gateway;
pub mod server;
pub mod socket;

pub use error::{GatewayError, HandshakeError, SocketError};
