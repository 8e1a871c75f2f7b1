//! First-byte protocol classification for accepted connections

use std::fmt;

/// SOCKS protocol version 5
pub const SOCKS5_VERSION: u8 = 0x05;
/// TLS record type `handshake`, the first byte of every ClientHello
pub const TLS_HANDSHAKE: u8 = 0x16;

/// Protocol spoken by a freshly accepted client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  /// SOCKS5 method negotiation
  Socks5,
  /// TLS-wrapped proxy session
  Tls,
  /// Plain HTTP/1.x proxy request
  Http,
}

impl Protocol {
  /// Classify a connection from its first byte
  pub fn classify(first: u8) -> Self {
    match first {
      SOCKS5_VERSION => Protocol::Socks5,
      TLS_HANDSHAKE => Protocol::Tls,
      _ => Protocol::Http,
    }
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Protocol::Socks5 => "socks5",
      Protocol::Tls => "tls",
      Protocol::Http => "http",
    };
    f.write_str(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::{ProxyConn, Side};
  use tokio::io::AsyncWriteExt;
  use tokio_util::sync::CancellationToken;

  #[test]
  fn test_classify_first_byte() {
    assert_eq!(Protocol::classify(0x05), Protocol::Socks5);
    assert_eq!(Protocol::classify(0x16), Protocol::Tls);
    assert_eq!(Protocol::classify(b'G'), Protocol::Http);
    assert_eq!(Protocol::classify(b'C'), Protocol::Http);
    assert_eq!(Protocol::classify(0x04), Protocol::Http);
  }

  #[tokio::test]
  async fn test_peek_does_not_consume() {
    let (client, mut peer) = tokio::io::duplex(64);
    peer.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut conn = ProxyConn::new(
      Box::new(client),
      Side::Client,
      CancellationToken::new(),
      std::time::Duration::from_secs(5),
    );
    let first = conn.peek_byte().await.unwrap();
    assert_eq!(Protocol::classify(first), Protocol::Socks5);
    let mut greeting = [0u8; 3];
    conn.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [0x05, 0x01, 0x00]);
  }
}
