//! Transport-agnostic message channel
//!
//! [`Channel`] is what higher-level RPC code sees: send a message, observe
//! messages, errors and close, and dispose. [`WebSocketChannel`] implements it
//! over a live [`WebSocket`].

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;
use tracing::{error, warn};

use crate::error::SocketError;
use crate::server::protocol::{CloseInfo, CLOSE_NORMAL};
use crate::socket::{ReadyState, WebSocket};

/// Observer for channel messages
pub type ChannelMessageObserver = Box<dyn Fn(&str) + Send + Sync>;
/// Observer for channel errors
pub type ChannelErrorObserver = Box<dyn Fn(&SocketError) + Send + Sync>;
/// Observer for channel close
pub type ChannelCloseObserver = Box<dyn Fn(&CloseInfo) + Send + Sync>;

/// Bidirectional message channel handed to RPC code
///
/// Every send is one logical message. Observers may be registered more than
/// once and are called in registration order.
pub trait Channel: Send + Sync {
    /// Send one message; failures are logged, never returned
    fn send(&self, content: &str);

    /// Observe received messages
    fn on_message(&self, observer: ChannelMessageObserver);

    /// Observe transport errors
    fn on_error(&self, observer: ChannelErrorObserver);

    /// Observe the channel closing
    fn on_close(&self, observer: ChannelCloseObserver);

    /// Close the underlying transport unless it is already closing or closed
    fn dispose(&self);
}

/// [`Channel`] over a WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketChannel {
    socket: Arc<WebSocket>,
}

impl WebSocketChannel {
    /// Wrap a live socket
    pub fn new(socket: Arc<WebSocket>) -> Self {
        Self { socket }
    }

    /// The wrapped socket
    pub fn socket(&self) -> &Arc<WebSocket> {
        &self.socket
    }
}

impl Channel for WebSocketChannel {
    fn send(&self, content: &str) {
        if let Err(e) = self.socket.send_text(content) {
            error!(socket = %self.socket.id(), error = %e, "failed to send message");
        }
    }

    fn on_message(&self, observer: ChannelMessageObserver) {
        let id = self.socket.id();
        self.socket.on_message(move |message| match message {
            Message::Text(text) => observer(text),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => observer(text),
                Err(_) => warn!(socket = %id, len = data.len(), "dropping non-UTF-8 binary message"),
            },
            _ => {}
        });
    }

    fn on_error(&self, observer: ChannelErrorObserver) {
        self.socket.on_error(move |e| observer(e));
    }

    fn on_close(&self, observer: ChannelCloseObserver) {
        self.socket.on_close(move |info| observer(info));
    }

    fn dispose(&self) {
        if self.socket.ready_state() < ReadyState::Closing {
            self.socket.close(CLOSE_NORMAL, "");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::open_pair;
    use crate::socket::SocketConfig;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fan_out_in_registration_order() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        let channel = WebSocketChannel::new(socket);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let first = tx.clone();
        channel.on_message(Box::new(move |text: &str| {
            let _ = first.send(format!("first:{text}"));
        }));
        channel.on_message(Box::new(move |text: &str| {
            let _ = tx.send(format!("second:{text}"));
        }));

        client.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "first:hello");
        assert_eq!(rx.recv().await.unwrap(), "second:hello");
        let extra = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_binary_utf8_forwarded() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        let channel = WebSocketChannel::new(socket);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        channel.on_message(Box::new(move |text: &str| {
            let _ = tx.send(text.to_string());
        }));

        client
            .send(Message::Binary(vec![0xff, 0xfe]))
            .await
            .unwrap();
        client
            .send(Message::Binary(b"{\"id\":1}".to_vec()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "{\"id\":1}");
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        let channel = WebSocketChannel::new(socket);
        channel.send(r#"{"jsonrpc":"2.0","method":"ready"}"#);
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text(r#"{"jsonrpc":"2.0","method":"ready"}"#.into())
        );
    }

    #[tokio::test]
    async fn test_send_after_close_is_swallowed() {
        let (socket, _client) = open_pair(SocketConfig::default()).await;
        let channel = WebSocketChannel::new(Arc::clone(&socket));
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        channel.on_error(Box::new(move |_: &SocketError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        socket.terminate();
        while socket.ready_state() != ReadyState::Closed {
            tokio::task::yield_now().await;
        }
        channel.send("too late");
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        let channel = WebSocketChannel::new(Arc::clone(&socket));
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        channel.on_close(Box::new(move |info: &CloseInfo| {
            assert_eq!(info.code, CLOSE_NORMAL);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        channel.dispose();
        channel.dispose();
        assert_eq!(socket.ready_state(), ReadyState::Closing);

        // The peer sees exactly one close frame and answers it
        let mut close_frames = 0;
        while let Some(Ok(message)) = client.next().await {
            if let Message::Close(_) = message {
                close_frames += 1;
            }
        }
        assert_eq!(close_frames, 1);

        while socket.ready_state() != ReadyState::Closed {
            tokio::task::yield_now().await;
        }
        channel.dispose();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
