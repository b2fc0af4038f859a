//! Listener Loop
//!
//! Binds the listening socket and accepts clients on a dedicated task. Each
//! accepted socket is registered and handed to its own [`ConnectionReader`].

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, ConnectionReader, ConnectionRegistry};
use crate::error::ServerError;
use crate::event::{ConnectionId, EventSink};

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    Stopped,
}

/// Everything the accept loop needs to set up a new reader
#[derive(Debug, Clone)]
pub struct AcceptContext {
    pub registry: Arc<ConnectionRegistry>,
    pub sink: EventSink,
    pub next_id: Arc<AtomicU64>,
    pub poll_interval: Duration,
    pub buffer_size: usize,
}

/// Parse an address string and port into a socket address.
///
/// Accepts IPv4 and IPv6 literals, IPv6 optionally wrapped in brackets.
pub fn parse_bind_target(address: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let trimmed = address.trim();
    let literal = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);

    literal
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| ServerError::invalid_address(format!("{}:{}", address, port)))
}

/// A bound listener with its accept task
pub struct ListenerLoop {
    local_addr: SocketAddr,
    state: ListenerState,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl ListenerLoop {
    /// Bind `address:port` and start accepting
    pub async fn start(address: &str, port: u16, ctx: AcceptContext) -> Result<Self, ServerError> {
        let bind_addr = parse_bind_target(address, port)?;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::bind_failed(bind_addr.to_string(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::bind_failed(bind_addr.to_string(), e))?;
        info!("Successfully bound to {}", local_addr);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(accept_connections(listener, ctx, shutdown_rx));

        Ok(Self {
            local_addr,
            state: ListenerState::Listening,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// The address actually bound; differs from the request when port 0 was asked for
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Stop accepting. Connections already accepted keep running.
    pub async fn stop(&mut self) {
        if self.state == ListenerState::Stopped {
            return;
        }
        self.state = ListenerState::Stopped;

        if self.shutdown_tx.send(()).is_err() {
            debug!("Accept loop already exited");
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Accept task failed: {}", e);
                }
            }
        }
        info!("Listener on {} stopped", self.local_addr);
    }
}

impl Drop for ListenerLoop {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Main connection acceptance loop
async fn accept_connections(
    listener: TcpListener,
    ctx: AcceptContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Starting connection acceptance loop");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Received stop signal, no longer accepting connections");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, remote)) => register_connection(stream, remote, &ctx),
                    Err(e) => {
                        // Transient (EMFILE, ECONNABORTED, ...); keep serving
                        warn!("Error accepting connection: {}", e);
                    }
                }
            }
        }
    }

    info!("Connection acceptance loop stopped");
}

fn register_connection(stream: TcpStream, remote: SocketAddr, ctx: &AcceptContext) {
    let id = ConnectionId(ctx.next_id.fetch_add(1, Ordering::Relaxed));
    debug!("Accepted connection {} from {}", id, remote);

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", remote, e);
    }

    let handle = Arc::new(ConnectionHandle::new(id, remote));
    // Registered before the reader runs so a fast disconnect cannot leave a stale entry
    ctx.registry.add(Arc::clone(&handle));

    let reader = ConnectionReader::new(
        stream,
        handle,
        Arc::clone(&ctx.registry),
        ctx.sink.clone(),
        ctx.poll_interval,
        ctx.buffer_size,
    );
    // Detached; the reader deregisters itself when it ends
    reader.start();
}
