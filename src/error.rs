//! Server Errors
//!
//! Errors surfaced to callers of the server lifecycle. Failures that are
//! local to a single client connection never show up here; they end that
//! connection and are reported through its `Disconnected` event instead.

use std::fmt;
use std::io;

use thiserror::Error;

/// Why a bind attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindErrorKind {
    /// The address string is not an IPv4 or IPv6 literal
    InvalidAddress,
    /// Another socket already owns the address
    AddressInUse,
    /// The OS refused the bind (privileged port, sandbox)
    PermissionDenied,
    /// Address not available on this host, or any other OS error
    Other,
}

impl BindErrorKind {
    /// Classify an I/O error returned by `bind`
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => BindErrorKind::AddressInUse,
            io::ErrorKind::PermissionDenied => BindErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => BindErrorKind::InvalidAddress,
            _ => BindErrorKind::Other,
        }
    }
}

impl fmt::Display for BindErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BindErrorKind::InvalidAddress => "invalid address",
            BindErrorKind::AddressInUse => "address in use",
            BindErrorKind::PermissionDenied => "permission denied",
            BindErrorKind::Other => "bind failed",
        };
        f.write_str(text)
    }
}

/// Error type for server lifecycle operations
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {target}: {kind}")]
    Bind {
        target: String,
        kind: BindErrorKind,
        #[source]
        source: Option<io::Error>,
    },
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
}

impl ServerError {
    /// Build a bind error for a target that could not be parsed
    pub fn invalid_address(target: impl Into<String>) -> Self {
        ServerError::Bind {
            target: target.into(),
            kind: BindErrorKind::InvalidAddress,
            source: None,
        }
    }

    /// Build a bind error from the OS error returned by `bind`
    pub fn bind_failed(target: impl Into<String>, source: io::Error) -> Self {
        ServerError::Bind {
            target: target.into(),
            kind: BindErrorKind::from_io(&source),
            source: Some(source),
        }
    }

    /// The bind failure kind, if this is a bind error
    pub fn bind_kind(&self) -> Option<BindErrorKind> {
        match self {
            ServerError::Bind { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_kind_classification() {
        let in_use = io::Error::new(io::ErrorKind::AddrInUse, "taken");
        assert_eq!(BindErrorKind::from_io(&in_use), BindErrorKind::AddressInUse);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(BindErrorKind::from_io(&denied), BindErrorKind::PermissionDenied);

        let other = io::Error::new(io::ErrorKind::AddrNotAvailable, "gone");
        assert_eq!(BindErrorKind::from_io(&other), BindErrorKind::Other);
    }

    #[test]
    fn test_error_messages() {
        let err = ServerError::invalid_address("not-an-ip:80");
        assert_eq!(err.to_string(), "cannot bind not-an-ip:80: invalid address");
        assert_eq!(err.bind_kind(), Some(BindErrorKind::InvalidAddress));
        assert_eq!(ServerError::AlreadyRunning.bind_kind(), None);
    }
}
