use thiserror::Error;

/// Represents the errors that can occur in the streaming server.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Represents a general connection error.
    ///
    /// This error occurs when a socket read or write fails or the peer misbehaves.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A socket operation did not complete within the per-socket timeout.
    #[error("Socket operation timed out")]
    Timeout,

    /// Represents a malformed HTTP request head.
    #[error("Request error: {0}")]
    RequestError(#[from] crate::server::message::RequestError),

    /// Represents a failure to provision the TLS context.
    ///
    /// The wrapped error tells the caller which piece of key material needs attention.
    #[error("TLS error: {0}")]
    TlsError(#[from] crate::server::tls::TlsError),

    /// Represents an error in the server configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Represents an error related to client operations.
    #[error("Client error: {0}")]
    ClientError(#[from] crate::server::client::ClientError),

    /// Binding or accepting on the listening socket failed.
    #[error("Listener error: {0}")]
    ListenerError(String),
}

/// Implements conversion from `std::io::Error` to `StreamError`.
///
/// Timeouts surface as `StreamError::Timeout` so callers can tell a stalled
/// peer from a broken one.
impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => StreamError::Timeout,
            _ => StreamError::ConnectionError(err.to_string()),
        }
    }
}
