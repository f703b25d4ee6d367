//! Live WebSocket handles
//!
//! A [`WebSocket`] is the shareable handle to one accepted connection. The
//! transport itself is owned by a driver task (see [`SocketDriver`]); the
//! handle talks to it through a command queue and receives events through
//! observer lists. Observers are invoked in registration order, and every
//! event for a socket is dispatched from its driver task, so events arrive in
//! the order the transport produced them.

mod driver;

pub use driver::SocketDriver;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SocketError, SocketResult};
use crate::server::protocol::{CloseInfo, CLOSE_NORMAL};

/// Observer for received data frames
pub type MessageObserver = Arc<dyn Fn(&Message) + Send + Sync>;
/// Observer for received pong frames
pub type PongObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Observer for transport errors
pub type ErrorObserver = Arc<dyn Fn(&SocketError) + Send + Sync>;
/// Observer for the close event
pub type CloseObserver = Arc<dyn Fn(&CloseInfo) + Send + Sync>;
/// One-shot observer for the open event
pub type OpenObserver = Box<dyn FnOnce(&Arc<WebSocket>) + Send>;

/// Connection state machine
///
/// States only move forward: `Connecting → Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-socket settings
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Time allowed for the peer to answer a close frame before the
    /// transport is dropped
    pub close_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(30),
        }
    }
}

/// Instructions from the handle to the driver task
#[derive(Debug)]
pub(crate) enum Command {
    Send(Message),
    Close(CloseFrame<'static>),
    Terminate,
}

#[derive(Default)]
struct Observers {
    open: Vec<OpenObserver>,
    message: Vec<MessageObserver>,
    pong: Vec<PongObserver>,
    error: Vec<ErrorObserver>,
    close: Vec<CloseObserver>,
}

/// Handle to a live WebSocket connection
pub struct WebSocket {
    id: Uuid,
    peer_addr: Option<SocketAddr>,
    config: SocketConfig,
    state: AtomicU8,
    commands: mpsc::UnboundedSender<Command>,
    observers: Mutex<Observers>,
    /// Wakes the driver out of a blocked write
    interrupt: Notify,
    terminating: AtomicBool,
    close_deadline: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.ready_state())
            .finish()
    }
}

impl WebSocket {
    /// Create a socket in the `Connecting` state together with its driver
    ///
    /// The driver must be run (or failed) by whoever owns the transport.
    pub fn new(config: SocketConfig) -> (Arc<Self>, SocketDriver) {
        Self::with_peer_addr(config, None)
    }

    /// Create a socket for a connection from a known remote address
    pub fn with_peer_addr(
        config: SocketConfig,
        peer_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, SocketDriver) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            config,
            state: AtomicU8::new(ReadyState::Connecting as u8),
            commands,
            observers: Mutex::new(Observers::default()),
            interrupt: Notify::new(),
            terminating: AtomicBool::new(false),
            close_deadline: Mutex::new(None),
        });
        let driver = SocketDriver::new(Arc::clone(&socket), commands_rx);
        (socket, driver)
    }

    /// Unique identity of this connection
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Current position in the connection state machine
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the socket is open for sending
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Queue a data frame for sending
    pub fn send(&self, message: Message) -> SocketResult<()> {
        self.enqueue(Command::Send(message))
    }

    /// Queue a text frame for sending
    pub fn send_text(&self, text: impl Into<String>) -> SocketResult<()> {
        self.send(Message::Text(text.into()))
    }

    /// Queue a ping control frame
    pub fn ping(&self, payload: &[u8]) -> SocketResult<()> {
        self.enqueue(Command::Send(Message::Ping(payload.to_vec())))
    }

    fn enqueue(&self, command: Command) -> SocketResult<()> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(SocketError::NotOpen(state));
        }
        self.commands
            .send(command)
            .map_err(|_| SocketError::Disconnected)
    }

    /// Start the close handshake
    ///
    /// Does nothing if the socket is already closing or closed. If the peer
    /// does not answer within the close timeout the transport is dropped,
    /// even when the close frame itself cannot be written.
    pub fn close(&self, code: u16, reason: &str) {
        if !self.begin_closing() {
            return;
        }
        debug!(socket = %self.id, code, "closing socket");
        *self.close_deadline.lock() = Some(Instant::now() + self.config.close_timeout);
        self.interrupt.notify_one();
        let frame = CloseInfo::new(code, reason).to_frame();
        if self.commands.send(Command::Close(frame)).is_err() {
            self.finish(CloseInfo::abnormal());
        }
    }

    /// Close with a normal status
    pub fn close_normal(&self) {
        self.close(CLOSE_NORMAL, "");
    }

    /// Drop the transport immediately without a close handshake
    ///
    /// Preempts a frame write that is blocked on a peer that stopped reading.
    pub fn terminate(&self) {
        if self.ready_state() == ReadyState::Closed {
            return;
        }
        debug!(socket = %self.id, "terminating socket");
        self.terminating.store(true, Ordering::Release);
        self.interrupt.notify_one();
        if self.commands.send(Command::Terminate).is_err() {
            self.finish(CloseInfo::abnormal());
        }
    }

    /// Run `observer` once the socket is open
    ///
    /// If the socket is already open the observer runs immediately. If the
    /// socket never opens the observer never runs.
    pub fn once_open(self: &Arc<Self>, observer: impl FnOnce(&Arc<WebSocket>) + Send + 'static) {
        {
            let mut observers = self.observers.lock();
            if self.ready_state() == ReadyState::Connecting {
                observers.open.push(Box::new(observer));
                return;
            }
        }
        if self.is_open() {
            observer(self);
        }
    }

    /// Register an observer for text and binary frames
    pub fn on_message(&self, observer: impl Fn(&Message) + Send + Sync + 'static) {
        self.observers.lock().message.push(Arc::new(observer));
    }

    /// Register an observer for pong frames
    pub fn on_pong(&self, observer: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.observers.lock().pong.push(Arc::new(observer));
    }

    /// Register an observer for transport errors
    pub fn on_error(&self, observer: impl Fn(&SocketError) + Send + Sync + 'static) {
        self.observers.lock().error.push(Arc::new(observer));
    }

    /// Register an observer for the close event
    pub fn on_close(&self, observer: impl Fn(&CloseInfo) + Send + Sync + 'static) {
        self.observers.lock().close.push(Arc::new(observer));
    }

    // ------------------------------------------------------------------------
    // State transitions, driven by the driver task
    // ------------------------------------------------------------------------

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// When the driver must give up on the close handshake
    pub(crate) fn close_deadline(&self) -> Option<Instant> {
        *self.close_deadline.lock()
    }

    /// Resolves after the next [`terminate`](Self::terminate) or
    /// [`close`](Self::close) call
    pub(crate) async fn interrupted(&self) {
        self.interrupt.notified().await;
    }

    /// `Connecting → Open`, then fire the open observers
    pub(crate) fn mark_open(self: &Arc<Self>) -> bool {
        let opened = self
            .state
            .compare_exchange(
                ReadyState::Connecting as u8,
                ReadyState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !opened {
            return false;
        }
        let pending = std::mem::take(&mut self.observers.lock().open);
        for observer in pending {
            observer(self);
        }
        true
    }

    /// `Connecting | Open → Closing`
    pub(crate) fn begin_closing(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ReadyState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ReadyState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Move to `Closed` and fire close observers exactly once
    pub(crate) fn finish(&self, info: CloseInfo) {
        let previous = self.state.swap(ReadyState::Closed as u8, Ordering::AcqRel);
        if previous == ReadyState::Closed as u8 {
            return;
        }
        debug!(socket = %self.id, code = info.code, "socket closed");
        // Dropping the lists releases closures that hold this socket.
        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in &observers.close {
            observer(&info);
        }
    }

    pub(crate) fn dispatch_message(&self, message: &Message) {
        let observers = self.observers.lock().message.clone();
        for observer in &observers {
            observer(message);
        }
    }

    pub(crate) fn dispatch_pong(&self, payload: &[u8]) {
        let observers = self.observers.lock().pong.clone();
        for observer in &observers {
            observer(payload);
        }
    }

    pub(crate) fn dispatch_error(&self, error: &SocketError) {
        let observers = self.observers.lock().error.clone();
        for observer in &observers {
            observer(error);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::server::protocol::CLOSE_ABNORMAL;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    /// Larger than the in-memory pipe, so writing it blocks until the peer reads
    fn oversized_text() -> String {
        "x".repeat(256 * 1024)
    }

    #[test]
    fn test_ready_state_order() {
        assert!(ReadyState::Connecting < ReadyState::Open);
        assert!(ReadyState::Open < ReadyState::Closing);
        assert!(ReadyState::Closing < ReadyState::Closed);
    }

    #[test]
    fn test_send_before_open_fails() {
        let (socket, _driver) = WebSocket::new(SocketConfig::default());
        assert_eq!(socket.ready_state(), ReadyState::Connecting);
        let result = socket.send_text("hello");
        assert!(matches!(
            result,
            Err(SocketError::NotOpen(ReadyState::Connecting))
        ));
    }

    #[tokio::test]
    async fn test_once_open_deferred_until_open() {
        let (socket, driver, _client, server) = socket_pair(SocketConfig::default()).await;
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        socket.once_open(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        tokio::spawn(driver.run(server));
        while !socket.is_open() {
            tokio::task::yield_now().await;
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        // Already open: runs immediately
        let counter = Arc::clone(&opened);
        socket.once_open(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_handshake_never_opens() {
        let (socket, driver) = WebSocket::new(SocketConfig::default());
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        socket.once_open(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&closed);
        socket.on_close(move |info| {
            assert!(info.is_abnormal());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        driver.fail(SocketError::Disconnected);
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_messages_in_order() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        socket.on_message(move |msg| {
            let _ = tx.send(msg.clone());
        });

        for i in 0..5 {
            client.send(Message::Text(format!("m{i}"))).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), Message::Text(format!("m{i}")));
        }
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        socket.send_text("hello").unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("hello".into())
        );
    }

    #[tokio::test]
    async fn test_peer_close_fires_close_once() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        socket.on_close(move |info| {
            let _ = tx.send(info.clone());
        });

        client
            .close(Some(CloseInfo::new(4000, "done").to_frame()))
            .await
            .unwrap();
        // Drive the client until the close handshake completes
        while let Some(Ok(_)) = client.next().await {}

        let info = rx.recv().await.unwrap();
        assert_eq!(info, CloseInfo::new(4000, "done"));
        assert!(rx.recv().await.is_none());
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_close_then_terminate_fires_close_once() {
        let (socket, _client) = open_pair(SocketConfig::default()).await;
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        socket.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.close_normal();
        assert_eq!(socket.ready_state(), ReadyState::Closing);
        socket.close_normal();
        socket.terminate();
        socket.terminate();

        while socket.ready_state() != ReadyState::Closed {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(socket.send_text("late"), Err(SocketError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_close_timeout_drops_silent_peer() {
        let config = SocketConfig {
            close_timeout: Duration::from_millis(50),
        };
        // The client is never polled, so it never answers the close frame
        let (socket, _client) = open_pair(config).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        socket.on_close(move |info| {
            let _ = tx.send(info.clone());
        });

        socket.close_normal();
        let info = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(info.is_abnormal());
    }

    #[tokio::test]
    async fn test_observers_can_reply_from_callback() {
        let (socket, mut client) = open_pair(SocketConfig::default()).await;
        let echo = Arc::clone(&socket);
        socket.on_message(move |msg| {
            if let Message::Text(text) = msg {
                echo.send_text(format!("echo:{text}")).unwrap();
            }
        });

        client.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("echo:hi".into())
        );
    }

    #[tokio::test]
    async fn test_terminate_preempts_blocked_write() {
        // The client is never polled, so the large frame never drains
        let (socket, _client) = open_pair(SocketConfig::default()).await;
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        socket.on_close(move |info| {
            assert!(info.is_abnormal());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.send_text(oversized_text()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(socket.is_open());

        socket.terminate();
        tokio::time::timeout(Duration::from_secs(1), async {
            while socket.ready_state() != ReadyState::Closed {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("terminate did not interrupt the blocked write");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_timeout_applies_while_write_blocked() {
        let config = SocketConfig {
            close_timeout: Duration::from_millis(50),
        };
        let (socket, _client) = open_pair(config).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        socket.on_close(move |info| {
            let _ = tx.send(info.clone());
        });

        socket.send_text(oversized_text()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The close frame is queued behind the stalled write
        socket.close_normal();

        let info = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("close timeout did not fire")
            .unwrap();
        assert!(info.is_abnormal());
    }

    #[tokio::test]
    async fn test_read_error_reaches_error_then_close_observers() {
        let (mut client_io, server_io) = tokio::io::duplex(1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let (socket, driver) = WebSocket::new(SocketConfig::default());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let errors = tx.clone();
        socket.on_error(move |e| {
            let transport = matches!(e, SocketError::Transport(_));
            let _ = errors.send(format!("error:{transport}"));
        });
        socket.on_close(move |info| {
            let _ = tx.send(format!("close:{}", info.code));
        });
        tokio::spawn(driver.run(server));

        // Clients must mask their frames; this one is not masked
        client_io.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "error:true");
        assert_eq!(rx.recv().await.unwrap(), format!("close:{CLOSE_ABNORMAL}"));
        assert!(rx.recv().await.is_none());
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }
}
