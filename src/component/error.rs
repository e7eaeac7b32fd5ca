//! Error taxonomy for the component listener.
//!
//! Each variant maps to one recovery policy: transport errors are retried by
//! the listener, protocol errors are logged and ignored or rejected,
//! negotiation errors tear down a single connection, and config errors stop
//! the server before it ever binds.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// Bind, listen, accept or socket I/O failure.
    #[error("transport error on {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer sent something the current phase does not accept.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// TLS handshake failure. Fatal to the connection, never retried.
    #[error("TLS negotiation with {peer} failed: {reason}")]
    Negotiation { peer: SocketAddr, reason: String },

    /// Invalid or incomplete configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// `accept` was called while every connection slot is occupied.
    #[error("a connection is already active ({active} of {capacity} slots in use)")]
    ConnectionActive { active: usize, capacity: usize },
}

impl ComponentError {
    pub fn transport(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            address: address.into(),
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the listener should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        assert!(ComponentError::transport("127.0.0.1:5347", io).is_retryable());
        assert!(!ComponentError::protocol("bad").is_retryable());
        assert!(!ComponentError::config("no cert").is_retryable());
        assert!(!ComponentError::Negotiation {
            peer: "127.0.0.1:1".parse().unwrap(),
            reason: "eof".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_transport_error_message_names_address() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = ComponentError::transport("0.0.0.0:5347", io);
        assert!(err.to_string().contains("0.0.0.0:5347"));
        assert!(err.to_string().contains("address in use"));
    }
}
