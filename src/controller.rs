//! Server Controller
//!
//! Owns the listener and the connection registry for one start/stop cycle
//! and funnels every connection event into a single sink.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionInfo, ConnectionRegistry};
use crate::error::ServerError;
use crate::event::{EventSink, EventStream};
use crate::listener::{AcceptContext, ListenerLoop};

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(text)
    }
}

/// Snapshot of controller status
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub local_addr: Option<SocketAddr>,
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_bytes_received: u64,
}

/// Starts and stops the server and exposes its status
pub struct ServerController {
    poll_interval: Duration,
    buffer_size: usize,
    shutdown_timeout: Duration,
    state: AtomicU8,
    registry: Arc<ConnectionRegistry>,
    sink: EventSink,
    next_id: Arc<AtomicU64>,
    listener: tokio::sync::Mutex<Option<ListenerLoop>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ServerController {
    /// Create a stopped controller and the event stream observers consume
    pub fn new(config: &ServerConfig) -> (Self, EventStream) {
        let (sink, events) = EventSink::channel();
        let controller = Self {
            poll_interval: config.poll_interval,
            buffer_size: config.read_buffer_size,
            shutdown_timeout: config.shutdown_timeout,
            state: AtomicU8::new(ServerState::Stopped as u8),
            registry: Arc::new(ConnectionRegistry::new()),
            sink,
            next_id: Arc::new(AtomicU64::new(1)),
            listener: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        };
        (controller, events)
    }

    /// Bind `address:port` and start accepting clients.
    ///
    /// Returns the bound address, which carries the real port when 0 was
    /// requested.
    pub async fn start(&self, address: &str, port: u16) -> Result<SocketAddr, ServerError> {
        if self
            .transition(ServerState::Stopped, ServerState::Starting)
            .is_err()
        {
            warn!("Start requested while server is {}", self.state());
            return Err(ServerError::AlreadyRunning);
        }

        let ctx = AcceptContext {
            registry: Arc::clone(&self.registry),
            sink: self.sink.clone(),
            next_id: Arc::clone(&self.next_id),
            poll_interval: self.poll_interval,
            buffer_size: self.buffer_size,
        };

        let listener = match ListenerLoop::start(address, port, ctx).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to start server: {}", e);
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        let local_addr = listener.local_addr();
        *self.listener.lock().await = Some(listener);
        *self.local_addr_slot() = Some(local_addr);
        self.set_state(ServerState::Running);

        info!("Server running on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, close every open connection, and wait for the readers
    /// to finish (bounded by the shutdown timeout)
    pub async fn stop(&self) -> Result<(), ServerError> {
        if self
            .transition(ServerState::Running, ServerState::Stopping)
            .is_err()
        {
            debug!("Stop requested while server is {}", self.state());
            return Err(ServerError::NotRunning);
        }

        info!("Stopping server");
        if let Some(mut listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }

        let handles = self.registry.snapshot();
        let forced = handles.iter().filter(|handle| handle.close()).count();
        info!("Closing {} active connections", forced);

        self.wait_for_connections_to_close().await;

        let stale = self.registry.clear();
        if stale > 0 {
            warn!("Dropped {} connections that did not finish in time", stale);
        }

        *self.local_addr_slot() = None;
        self.set_state(ServerState::Stopped);
        info!("Server stopped");
        Ok(())
    }

    async fn wait_for_connections_to_close(&self) {
        let start_time = Instant::now();

        while !self.registry.is_empty() && start_time.elapsed() < self.shutdown_timeout {
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
        }

        let remaining = self.registry.len();
        if remaining == 0 {
            debug!("All connections closed in {:?}", start_time.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                start_time.elapsed(),
                remaining
            );
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Number of currently registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr_slot()
    }

    /// Details of every open connection, in acceptance order
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.infos()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            state: self.state(),
            local_addr: self.local_addr(),
            active_connections: self.registry.count(),
            total_connections: self.registry.total_registered(),
            total_bytes_received: self.registry.total_bytes_received(),
        }
    }

    fn transition(&self, from: ServerState, to: ServerState) -> Result<(), ServerState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ServerState::from_u8)
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn local_addr_slot(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ServerController {
    fn drop(&mut self) {
        // Readers outlive the controller otherwise
        for handle in self.registry.snapshot() {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindErrorKind;

    fn controller() -> (ServerController, EventStream) {
        let config = ServerConfig {
            poll_interval: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        ServerController::new(&config)
    }

    #[tokio::test]
    async fn test_initial_status() {
        let (controller, _events) = controller();
        let status = controller.status();
        assert_eq!(status.state, ServerState::Stopped);
        assert_eq!(status.active_connections, 0);
        assert!(status.local_addr.is_none());
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let (controller, _events) = controller();
        let addr = controller.start("127.0.0.1", 0).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(controller.is_running());
        assert_eq!(controller.local_addr(), Some(addr));

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), ServerState::Stopped);
        assert!(controller.local_addr().is_none());

        // A stopped controller can be started again
        controller.start("127.0.0.1", 0).await.unwrap();
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_address_leaves_stopped() {
        let (controller, _events) = controller();
        let err = controller.start("not-an-ip", 80).await.unwrap_err();
        assert_eq!(err.bind_kind(), Some(BindErrorKind::InvalidAddress));
        assert_eq!(controller.state(), ServerState::Stopped);
        assert!(controller.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_sequencing_errors() {
        let (controller, _events) = controller();
        assert!(matches!(controller.stop().await, Err(ServerError::NotRunning)));

        controller.start("127.0.0.1", 0).await.unwrap();
        assert!(matches!(
            controller.start("127.0.0.1", 0).await,
            Err(ServerError::AlreadyRunning)
        ));
        assert!(controller.is_running());

        controller.stop().await.unwrap();
        assert!(matches!(controller.stop().await, Err(ServerError::NotRunning)));
    }
}
