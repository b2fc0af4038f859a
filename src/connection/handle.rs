//! Connection Handle
//!
//! The shared, externally visible side of one accepted connection. The
//! socket itself is owned by the reader task; the handle carries the
//! metadata and the close request the controller uses to stop it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::event::ConnectionId;

/// Point-in-time view of a connection, for status display
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    #[serde(with = "humantime_serde")]
    pub opened_at: SystemTime,
    #[serde(with = "humantime_serde")]
    pub idle_for: Duration,
    pub bytes_received: u64,
}

/// Handle to one live connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: SocketAddr,
    opened_at: SystemTime,
    start_time: Instant,
    /// Milliseconds since `start_time` of the last non-empty read
    last_activity_ms: AtomicU64,
    bytes_received: AtomicU64,
    closed: AtomicBool,
    terminated: AtomicBool,
    close_requested: Notify,
}

impl ConnectionHandle {
    /// Create a handle for a freshly accepted connection
    pub fn new(id: ConnectionId, remote: SocketAddr) -> Self {
        Self {
            id,
            remote,
            opened_at: SystemTime::now(),
            start_time: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            close_requested: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    /// Whether the connection is still open
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Whether the reader has run its termination path
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Ask the owning reader to close the connection.
    ///
    /// Returns `true` only for the call that actually flipped the connection
    /// to closed; later calls, or calls after the reader already closed it,
    /// are no-ops.
    pub fn close(&self) -> bool {
        if self.mark_closed() {
            debug!("Close requested for connection {} ({})", self.id, self.remote);
            // notify_one stores a permit, so a reader that is between polls still sees it
            self.close_requested.notify_one();
            true
        } else {
            false
        }
    }

    /// Resolves once `close` has been called
    pub(crate) async fn close_requested(&self) {
        self.close_requested.notified().await
    }

    /// Flip to closed; `true` if this call did it
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Claim the termination path; `true` for exactly one caller
    pub(crate) fn begin_termination(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    /// Record a non-empty read
    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        let elapsed = self.start_time.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Time since the last received byte, or since accept if nothing arrived
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start_time.elapsed().saturating_sub(last)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote: self.remote,
            opened_at: self.opened_at,
            idle_for: self.idle_for(),
            bytes_received: self.bytes_received(),
        }
    }
}
