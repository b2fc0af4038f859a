//! sockwatch Library
//!
//! A TCP listener that accepts any number of concurrent clients, reads
//! each one on its own task, and reports connects, received data and
//! disconnects through a single event stream.

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod event;
pub mod listener;
pub mod shutdown;

pub use config::Config;
pub use connection::{ConnectionInfo, ConnectionRegistry};
pub use controller::{ServerController, ServerState, ServerStatus};
pub use error::{BindErrorKind, ServerError};
pub use event::{ConnectionId, EventSink, EventStream, ServerEvent};
pub use shutdown::ShutdownCoordinator;

/// Common error type for configuration and the binary
pub type Result<T> = anyhow::Result<T>;
