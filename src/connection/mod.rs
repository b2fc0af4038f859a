//! Connection Module
//!
//! Per-connection reading, the shared handle used to close a connection
//! from outside, and the registry of open connections.

pub mod handle;
pub mod reader;
pub mod registry;

pub use handle::{ConnectionHandle, ConnectionInfo};
pub use reader::{ConnectionReader, Termination};
pub use registry::ConnectionRegistry;
