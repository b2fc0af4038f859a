//! Connection Reader
//!
//! One reader owns one accepted socket and runs on its own task until the
//! peer goes away, a read fails, or the controller closes the connection.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use super::handle::ConnectionHandle;
use super::registry::ConnectionRegistry;
use crate::event::{EventSink, ServerEvent};

/// Why a read loop ended
#[derive(Debug)]
pub enum Termination {
    /// The peer closed its side (zero-byte read)
    PeerClosed,
    /// The connection was closed from outside
    ForcedClose,
    /// A read failed; handled the same as a disconnect
    ReadError(io::Error),
}

/// Reads one connection and reports what it sees
pub struct ConnectionReader {
    stream: TcpStream,
    handle: Arc<ConnectionHandle>,
    registry: Arc<ConnectionRegistry>,
    sink: EventSink,
    poll_interval: Duration,
    buffer_size: usize,
}

impl ConnectionReader {
    pub fn new(
        stream: TcpStream,
        handle: Arc<ConnectionHandle>,
        registry: Arc<ConnectionRegistry>,
        sink: EventSink,
        poll_interval: Duration,
        buffer_size: usize,
    ) -> Self {
        Self {
            stream,
            handle,
            registry,
            sink,
            poll_interval,
            buffer_size,
        }
    }

    /// Spawn the read loop. `Connected` is emitted before the first read.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    #[instrument(skip(self), fields(connection_id = %self.handle.id(), remote = %self.handle.remote()))]
    async fn run(mut self) {
        let id = self.handle.id();
        let remote = self.handle.remote();

        info!("Client {} connected as {}", remote, id);
        self.sink.emit(ServerEvent::Connected { id, remote });

        let reason = self.read_loop().await;
        self.terminate(reason).await;
    }

    async fn read_loop(&mut self) -> Termination {
        let mut buf = BytesMut::with_capacity(self.buffer_size);

        loop {
            buf.reserve(self.buffer_size);

            tokio::select! {
                biased;

                _ = self.handle.close_requested() => {
                    return Termination::ForcedClose;
                }
                result = timeout(self.poll_interval, self.stream.read_buf(&mut buf)) => {
                    match result {
                        // Nothing arrived within the poll interval; the peer is idle, not gone
                        Err(_) => {
                            trace!("No data within {:?}, still connected", self.poll_interval);
                        }
                        Ok(Ok(0)) => return Termination::PeerClosed,
                        Ok(Ok(n)) => {
                            let payload = buf.split().freeze();
                            self.handle.record_read(n);
                            self.registry.record_received(n);
                            debug!("Received {} bytes", n);
                            self.sink.emit(ServerEvent::MessageReceived {
                                id: self.handle.id(),
                                remote: self.handle.remote(),
                                payload,
                            });
                        }
                        Ok(Err(e)) => return Termination::ReadError(e),
                    }
                }
            }
        }
    }

    /// Close, deregister, and report. Runs at most once per connection.
    async fn terminate(mut self, reason: Termination) {
        if !self.handle.begin_termination() {
            return;
        }

        let id = self.handle.id();
        let remote = self.handle.remote();

        match &reason {
            Termination::PeerClosed => info!("Client {} closed the connection", remote),
            Termination::ForcedClose => info!("Closing connection to {} on request", remote),
            Termination::ReadError(e) => warn!("Read from {} failed, disconnecting: {}", remote, e),
        }

        // Closed and deregistered back to back so status never lists a closed connection
        self.handle.mark_closed();
        if self.registry.remove(id).is_none() {
            debug!("Connection {} was already deregistered", id);
        }

        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} reported: {}", remote, e);
        }
        drop(self.stream);

        info!(
            "Connection {} from {} closed after {:?}, {} bytes received",
            id,
            remote,
            self.handle.opened_at().elapsed().unwrap_or_default(),
            self.handle.bytes_received()
        );
        self.sink.emit(ServerEvent::Disconnected { id, remote });
    }
}
