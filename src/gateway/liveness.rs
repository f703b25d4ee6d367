//! Liveness monitoring
//!
//! Each registration owns one [`LivenessMonitor`]. The monitor keeps the
//! registration's connection table, pairing every accepted socket with its
//! liveness state, and runs one periodic task that probes the table.
//!
//! Two probing strategies are supported:
//!
//! - **Transport ping**: every interval each connection is sent a native ping
//!   and marked as awaiting a pong. A connection still awaiting its pong at
//!   the next interval is terminated.
//! - **Protocol ping**: the peer sends `{"kind":"ping"}` text frames and gets
//!   `{"kind":"pong"}` back. Any received message counts as activity, and a
//!   connection idle for the whole timeout is closed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::server::protocol::{
    LivenessMessage, CLOSE_GOING_AWAY, PONG_SENTINEL, TRANSPORT_PING_PAYLOAD,
};
use crate::socket::WebSocket;

/// Default transport ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default protocol ping idle window
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Shortest period between monitor ticks
const MIN_TICK_PERIOD: Duration = Duration::from_millis(10);

/// How a registration checks that its peers are still there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessMode {
    /// Native ping frames on a fixed interval
    TransportPing { interval: Duration },
    /// Peer-sent ping sentinels plus an idle timeout
    ProtocolPing { idle_timeout: Duration },
    /// Connections are tracked but never probed
    Disabled,
}

impl Default for LivenessMode {
    fn default() -> Self {
        Self::TransportPing {
            interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// A socket paired with its liveness state
#[derive(Debug)]
struct TrackedConnection {
    socket: Arc<WebSocket>,
    /// Cleared when a probe is sent, set again by the pong
    alive: bool,
    last_activity: Instant,
}

type ConnectionTable = Mutex<HashMap<Uuid, TrackedConnection>>;

/// Tracks a registration's open connections and reclaims unresponsive ones
pub struct LivenessMonitor {
    mode: LivenessMode,
    connections: Arc<ConnectionTable>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessMonitor {
    /// Create a monitor and start its periodic task
    ///
    /// Must be called from within a tokio runtime unless `mode` is
    /// [`LivenessMode::Disabled`]. Periods shorter than 10ms, including
    /// zero, are raised to 10ms.
    pub fn start(mode: LivenessMode) -> Self {
        let connections: Arc<ConnectionTable> = Arc::new(Mutex::new(HashMap::new()));
        let task = match mode {
            LivenessMode::TransportPing { interval } => {
                let table = Arc::clone(&connections);
                let period = interval.max(MIN_TICK_PERIOD);
                Some(tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        probe(&table);
                    }
                }))
            }
            LivenessMode::ProtocolPing { idle_timeout } => {
                let table = Arc::clone(&connections);
                let period = (idle_timeout / 4).max(MIN_TICK_PERIOD);
                Some(tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        sweep_idle(&table, idle_timeout);
                    }
                }))
            }
            LivenessMode::Disabled => None,
        };

        Self {
            mode,
            connections,
            task: Mutex::new(task),
        }
    }

    /// The probing strategy in use
    pub fn mode(&self) -> LivenessMode {
        self.mode
    }

    /// Add an open socket to the connection table
    ///
    /// Registers the monitor's observers on the socket. This happens once per
    /// connection; probe cycles never register further observers.
    pub fn track(&self, socket: &Arc<WebSocket>) {
        let id = socket.id();
        self.connections.lock().insert(
            id,
            TrackedConnection {
                socket: Arc::clone(socket),
                alive: true,
                last_activity: Instant::now(),
            },
        );

        let table = Arc::downgrade(&self.connections);
        socket.on_close(move |info| {
            if let Some(table) = table.upgrade() {
                table.lock().remove(&id);
            }
            debug!(socket = %id, code = info.code, "connection untracked");
        });

        match self.mode {
            LivenessMode::TransportPing { .. } => {
                let table = Arc::downgrade(&self.connections);
                socket.on_pong(move |_| {
                    with_entry(&table, id, |entry| entry.alive = true);
                });
            }
            LivenessMode::ProtocolPing { .. } => {
                let table = Arc::downgrade(&self.connections);
                let replier = Arc::downgrade(socket);
                socket.on_message(move |message| {
                    with_entry(&table, id, |entry| entry.last_activity = Instant::now());
                    let Message::Text(text) = message else {
                        return;
                    };
                    if !LivenessMessage::is_ping(text) {
                        return;
                    }
                    if let Some(socket) = replier.upgrade() {
                        if let Err(e) = socket.send_text(PONG_SENTINEL) {
                            error!(socket = %id, error = %e, "failed to send pong");
                        }
                    }
                });
            }
            LivenessMode::Disabled => {}
        }

        debug!(socket = %id, mode = ?self.mode, "connection tracked");
    }

    /// Number of connections currently tracked
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Snapshot of the tracked sockets
    pub fn connections(&self) -> Vec<Arc<WebSocket>> {
        self.connections
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.socket))
            .collect()
    }

    /// Liveness flag of a tracked connection
    pub fn is_alive(&self, id: Uuid) -> Option<bool> {
        self.connections.lock().get(&id).map(|entry| entry.alive)
    }

    /// Stop the periodic task
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn probe(&self) {
        probe(&self.connections);
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn with_entry(table: &Weak<ConnectionTable>, id: Uuid, f: impl FnOnce(&mut TrackedConnection)) {
    if let Some(table) = table.upgrade() {
        if let Some(entry) = table.lock().get_mut(&id) {
            f(entry);
        }
    }
}

/// One transport-ping cycle
fn probe(table: &ConnectionTable) {
    let snapshot: Vec<(Arc<WebSocket>, bool)> = table
        .lock()
        .values_mut()
        .map(|entry| {
            let was_alive = entry.alive;
            entry.alive = false;
            (Arc::clone(&entry.socket), was_alive)
        })
        .collect();

    for (socket, was_alive) in snapshot {
        if !was_alive {
            warn!(socket = %socket.id(), "no pong since last probe, terminating");
            socket.terminate();
            continue;
        }
        if let Err(e) = socket.ping(TRANSPORT_PING_PAYLOAD) {
            warn!(socket = %socket.id(), error = %e, "failed to send ping, terminating");
            socket.terminate();
        }
    }
}

/// One protocol-ping idle sweep
fn sweep_idle(table: &ConnectionTable, idle_timeout: Duration) {
    let now = Instant::now();
    let idle: Vec<Arc<WebSocket>> = table
        .lock()
        .values()
        .filter(|entry| now.duration_since(entry.last_activity) >= idle_timeout)
        .map(|entry| Arc::clone(&entry.socket))
        .collect();

    for socket in idle {
        warn!(socket = %socket.id(), "connection idle, closing");
        socket.close(CLOSE_GOING_AWAY, "idle timeout");
    }
}
