//! Error types for the relay

use std::io;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for relay operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP message construction error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// HTTP/2 framing or stream error
  #[error("HTTP/2 error: {0}")]
  H2(h2::Error),

  /// WebSocket codec error
  #[error("WebSocket error: {0}")]
  WebSocket(tokio_tungstenite::tungstenite::Error),

  /// Malformed bytes from a peer
  #[error("Protocol violation: {0}")]
  Protocol(String),

  /// Rejected credentials or source address
  #[error("Authentication failed: {0}")]
  Auth(String),

  /// Dial or handshake towards the upstream failed
  #[error("Upstream error: {0}")]
  Upstream(String),

  /// The two legs negotiated a combination the bridge cannot serve
  #[error("Unsupported negotiation: {0}")]
  Unsupported(String),

  /// An interceptor dropped a message that needed an answer
  #[error("Blocked by interceptor: {0}")]
  Blocked(String),

  /// The connection was closed or cancelled
  #[error("Connection closed")]
  Closed,

  /// No activity within the idle timeout
  #[error("Idle timeout elapsed")]
  Timeout,

  /// A connection task panicked
  #[error("Internal error: {0}")]
  Internal(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a protocol violation error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an authentication error and log it
  pub fn auth(msg: impl Into<String>) -> Self {
    let error = Error::Auth(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an unsupported negotiation error and log it
  pub fn unsupported(msg: impl Into<String>) -> Self {
    let error = Error::Unsupported(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a blocked error and log it
  pub fn blocked(msg: impl Into<String>) -> Self {
    let error = Error::Blocked(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an internal error and log it
  pub fn internal(msg: impl Into<String>) -> Self {
    let error = Error::Internal(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether this error is an ordinary end of a relay rather than a failure
  pub fn is_closed(&self) -> bool {
    match self {
      Error::Closed => true,
      Error::Io(e) => matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::BrokenPipe
          | io::ErrorKind::ConnectionAborted
      ),
      _ => false,
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::trace!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::debug!("{}", error);
    error
  }
}

impl From<h2::Error> for Error {
  fn from(value: h2::Error) -> Self {
    let error = match value.get_io() {
      Some(io) => Error::Io(io::Error::new(io.kind(), io.to_string())),
      None => Error::H2(value),
    };
    tracing::debug!("{}", error);
    error
  }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
  fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
    use tokio_tungstenite::tungstenite::Error as WsError;
    let error = match value {
      WsError::ConnectionClosed | WsError::AlreadyClosed => Error::Closed,
      WsError::Io(e) => Error::Io(e),
      other => Error::WebSocket(other),
    };
    tracing::debug!("{}", error);
    error
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_closed_classification() {
    assert!(Error::Closed.is_closed());
    assert!(Error::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_closed());
    assert!(!Error::protocol("bad version").is_closed());
    assert!(!Error::Timeout.is_closed());
  }
}
