//! RPC connection factories
//!
//! An RPC layer consumes a [`Channel`] through [`RpcConnectionFactory`]. The
//! gateway defines no RPC methods; [`JsonMessageConnection`] only exchanges
//! JSON documents, one per frame.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::channel::Channel;
use crate::error::SocketError;
use crate::server::protocol::{CloseInfo, ProtocolResult};

/// Builds a structured message connection on top of a channel
pub trait RpcConnectionFactory: Send + Sync + 'static {
    /// The connection type handed to the caller
    type Connection: Send + 'static;

    /// Wrap `channel` in a message connection
    fn create(&self, channel: Arc<dyn Channel>) -> Self::Connection;
}

/// Factory for [`JsonMessageConnection`]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConnectionFactory;

impl RpcConnectionFactory for JsonConnectionFactory {
    type Connection = JsonMessageConnection;

    fn create(&self, channel: Arc<dyn Channel>) -> JsonMessageConnection {
        JsonMessageConnection::new(channel)
    }
}

/// Connection exchanging JSON values over a [`Channel`]
#[derive(Clone)]
pub struct JsonMessageConnection {
    channel: Arc<dyn Channel>,
}

impl JsonMessageConnection {
    /// Wrap a channel
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// The underlying channel
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Serialize and send one message
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> ProtocolResult<()> {
        let json = serde_json::to_string(message)?;
        self.channel.send(&json);
        Ok(())
    }

    /// Observe received messages
    ///
    /// Frames that are not valid JSON are logged and skipped.
    pub fn on_message(&self, observer: impl Fn(Value) + Send + Sync + 'static) {
        self.channel.on_message(Box::new(move |text: &str| {
            match serde_json::from_str::<Value>(text) {
                Ok(value) => observer(value),
                Err(e) => warn!(error = %e, "dropping malformed JSON message"),
            }
        }));
    }

    /// Observe transport errors
    pub fn on_error(&self, observer: impl Fn(&SocketError) + Send + Sync + 'static) {
        self.channel.on_error(Box::new(observer));
    }

    /// Observe the connection closing
    pub fn on_close(&self, observer: impl Fn(&CloseInfo) + Send + Sync + 'static) {
        self.channel.on_close(Box::new(observer));
    }

    /// Close the connection
    pub fn dispose(&self) {
        self.channel.dispose();
    }
}
