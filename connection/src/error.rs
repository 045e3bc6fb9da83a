//! Error types for connection handling.

use bitcoin::consensus::encode;
use std::error::Error;
use std::fmt;
use std::io;

/// Errors that can occur while talking to a remote node.
///
/// Every variant describes the failure of a single attempt. Callers are
/// expected to log them and move on to the next node.
#[derive(Debug)]
pub enum ConnectionError {
    /// An I/O error occurred during network operations.
    Io(io::Error),
    /// A message could not be deserialized.
    Deserialize(encode::Error),
    /// Network magic in a received message doesn't match the configured value.
    MagicMismatch,
    /// The remote node violated the version handshake.
    ProtocolFailed(&'static str),
    /// Detected a connection loop (attempting to connect to ourselves).
    ConnectionLoop,
    /// The SOCKS5 proxy refused or failed the request.
    ProxyFailed(String),
    /// Onion targets require a proxy and none is configured.
    ProxyRequired,
    /// The operation did not finish within the socket timeout.
    Timeout,
    /// The connection was already closed.
    Closed,
}

impl ConnectionError {
    /// Returns `true` for failures of the byte transport (socket, proxy, framing).
    pub fn is_transport(&self) -> bool {
        !self.is_protocol()
    }

    /// Returns `true` for bitcoin p2p protocol violations.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ConnectionError::ProtocolFailed(_) | ConnectionError::ConnectionLoop
        )
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(err) => write!(f, "Connection error: {err}"),
            ConnectionError::Deserialize(err) => write!(f, "Failed to decode message: {err}"),
            ConnectionError::MagicMismatch => write!(f, "Network magic mismatch"),
            ConnectionError::ProtocolFailed(reason) => {
                write!(f, "Protocol handling failed in peer communication: {reason}")
            }
            ConnectionError::ConnectionLoop => {
                write!(f, "Detected connection to self (matching nonce)")
            }
            ConnectionError::ProxyFailed(reason) => write!(f, "Proxy failed: {reason}"),
            ConnectionError::ProxyRequired => {
                write!(f, "Onion address requires a configured proxy")
            }
            ConnectionError::Timeout => write!(f, "Operation timed out"),
            ConnectionError::Closed => write!(f, "Connection already closed"),
        }
    }
}

impl Error for ConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnectionError::Io(err) => Some(err),
            ConnectionError::Deserialize(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io(err)
    }
}

impl From<encode::Error> for ConnectionError {
    fn from(err: encode::Error) -> Self {
        ConnectionError::Deserialize(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ConnectionError::ConnectionLoop.is_protocol());
        assert!(ConnectionError::ProtocolFailed("no version").is_protocol());
        assert!(ConnectionError::Timeout.is_transport());
        assert!(ConnectionError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).is_transport());
    }
}
