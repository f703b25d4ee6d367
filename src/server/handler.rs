//! Upgrade listeners
//!
//! A listener is offered every upgrade request the transport server receives.
//! It either takes ownership of the connection or hands it back untouched so
//! the next listener can look at it.

use bytes::Bytes;
use tokio::net::TcpStream;

use super::request::UpgradeRequest;

/// An upgrade request waiting to be claimed
#[derive(Debug)]
pub struct PendingUpgrade {
    /// Request metadata
    pub request: UpgradeRequest,
    /// Raw transport connection
    pub stream: TcpStream,
    /// Bytes received after the request head
    pub head: Bytes,
}

/// Receives upgrade requests from a [`TransportServer`](super::TransportServer)
pub trait UpgradeListener: Send + Sync {
    /// Claim the upgrade by consuming it, or return it unchanged
    fn on_upgrade(&self, upgrade: PendingUpgrade) -> Option<PendingUpgrade>;
}

impl<F> UpgradeListener for F
where
    F: Fn(PendingUpgrade) -> Option<PendingUpgrade> + Send + Sync,
{
    fn on_upgrade(&self, upgrade: PendingUpgrade) -> Option<PendingUpgrade> {
        self(upgrade)
    }
}
