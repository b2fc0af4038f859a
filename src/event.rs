//! Server Events
//!
//! Every connection lifecycle and data event flows through a single
//! [`EventSink`]. Observers hold the matching receiver and may consume it
//! from any task or thread.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tracing::debug;

/// Identity of one accepted connection, unique for the life of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Event produced by a connection reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        id: ConnectionId,
        remote: SocketAddr,
    },
    MessageReceived {
        id: ConnectionId,
        remote: SocketAddr,
        #[serde(serialize_with = "serialize_lossy")]
        payload: Bytes,
    },
    Disconnected {
        id: ConnectionId,
        remote: SocketAddr,
    },
}

impl ServerEvent {
    /// Connection the event belongs to
    pub fn id(&self) -> ConnectionId {
        match self {
            ServerEvent::Connected { id, .. }
            | ServerEvent::MessageReceived { id, .. }
            | ServerEvent::Disconnected { id, .. } => *id,
        }
    }

    /// Remote peer address
    pub fn remote(&self) -> SocketAddr {
        match self {
            ServerEvent::Connected { remote, .. }
            | ServerEvent::MessageReceived { remote, .. }
            | ServerEvent::Disconnected { remote, .. } => *remote,
        }
    }

    /// Payload rendered as text, for `MessageReceived` only
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match self {
            ServerEvent::MessageReceived { payload, .. } => Some(String::from_utf8_lossy(payload)),
            _ => None,
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Connected { id, remote } => write!(f, "[{}] {} connected", id, remote),
            ServerEvent::MessageReceived { id, remote, payload } => write!(
                f,
                "[{}] {}: {}",
                id,
                remote,
                String::from_utf8_lossy(payload)
            ),
            ServerEvent::Disconnected { id, remote } => {
                write!(f, "[{}] {} disconnected", id, remote)
            }
        }
    }
}

fn serialize_lossy<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(payload))
}

/// Sending half of the event channel, cloned into every reader
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Receiving half handed to the observer
pub type EventStream = mpsc::UnboundedReceiver<ServerEvent>;

impl EventSink {
    /// Create a sink and the stream observers read from
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. A dropped observer is not an error for the server.
    pub fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("No observer attached, dropping event: {}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut stream) = EventSink::channel();
        let id = ConnectionId(7);

        sink.emit(ServerEvent::Connected { id, remote: remote() });
        sink.emit(ServerEvent::MessageReceived {
            id,
            remote: remote(),
            payload: Bytes::from_static(b"hi"),
        });
        sink.emit(ServerEvent::Disconnected { id, remote: remote() });

        assert!(matches!(stream.recv().await, Some(ServerEvent::Connected { .. })));
        let message = stream.recv().await.unwrap();
        assert_eq!(message.text().as_deref(), Some("hi"));
        assert!(matches!(stream.recv().await, Some(ServerEvent::Disconnected { .. })));
    }

    #[test]
    fn test_emit_without_observer_is_silent() {
        let (sink, stream) = EventSink::channel();
        drop(stream);
        sink.emit(ServerEvent::Connected {
            id: ConnectionId(1),
            remote: remote(),
        });
    }

    #[test]
    fn test_json_shape() {
        let event = ServerEvent::MessageReceived {
            id: ConnectionId(3),
            remote: remote(),
            payload: Bytes::from_static(b"hello"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "message_received");
        assert_eq!(json["id"], 3);
        assert_eq!(json["remote"], "127.0.0.1:40000");
        assert_eq!(json["payload"], "hello");
        assert_eq!(event.to_string(), "[conn_3] 127.0.0.1:40000: hello");
    }
}
