//! Error types for each layer of the SDK.
//!
//! Transport and peer-connection failures are surfaced to the call that
//! triggered them. Malformed relay frames ([`FrameError`]) never reach a
//! caller: the transport logs and drops them.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Failures of the relay control connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `send` was attempted while no live relay connection exists.
    #[error("transport not connected")]
    NotConnected,

    /// The WebSocket handshake failed before the connection reached the open state.
    #[error("relay handshake failed: {0}")]
    HandshakeFailed(#[source] Box<tungstenite::Error>),

    /// The handshake did not complete within the configured timeout.
    #[error("relay handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// `close()` was called while a handshake was in flight.
    #[error("transport closed during connect")]
    Closed,

    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("auth token is not a valid header value")]
    InvalidToken,

    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl TransportError {
    /// True for failures that happened before the relay connection opened.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_) | Self::HandshakeTimeout(_) | Self::InvalidToken | Self::Tls(_)
        )
    }
}

/// A relay frame that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed payload encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("binary frame is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Failures of a single peer connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer connection was already closed.
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of a tunnel's local listener lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to bind tunnel listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stop tunnel listener: {0}")]
    Stop(#[from] tokio::task::JoinError),

    #[error("invalid tunnel config: {0}")]
    InvalidConfig(String),

    #[error("tunnel protocol {0} is not supported")]
    UnsupportedProtocol(String),

    #[error("tunnel {0} was already started")]
    AlreadyStarted(String),

    #[error("tunnel {0} not found")]
    NotFound(String),
}

/// Invalid or unloadable client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("token is required")]
    MissingToken,

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Errors returned by [`crate::Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_failures_are_classified() {
        assert!(TransportError::HandshakeTimeout(Duration::from_secs(1)).is_handshake_failure());
        assert!(TransportError::InvalidToken.is_handshake_failure());
        assert!(!TransportError::NotConnected.is_handshake_failure());
        assert!(!TransportError::Closed.is_handshake_failure());
    }

    #[test]
    fn connection_error_wraps_transport() {
        let err: ConnectionError = TransportError::NotConnected.into();
        assert!(matches!(
            err,
            ConnectionError::Transport(TransportError::NotConnected)
        ));
        assert_eq!(err.to_string(), "transport not connected");
    }
}
