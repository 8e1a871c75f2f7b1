//! Upstream TLS handshakes and impersonation profiles
//!
//! The relay never talks TLS to an origin directly; it hands the raw stream to
//! a [`TlsHandshaker`] together with the ALPN list to offer and the
//! connection's [`FingerprintSpec`]. The default [`RustlsHandshaker`] honours
//! the ALPN list and HTTP/2 settings of a profile. Shaping the ClientHello to
//! a JA3 string needs an engine that controls extension order, which is what
//! a custom handshaker is for.

use crate::conn::{bare_host, BoxStream};
use crate::error::{Error, Result};
use crate::tls;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// ALPN identifier for HTTP/2
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for HTTP/1.1
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// HTTP/2 SETTINGS and window sizes sent on re-originated connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H2Settings {
  pub header_table_size: Option<u32>,
  pub enable_push: Option<bool>,
  pub max_concurrent_streams: Option<u32>,
  pub initial_window_size: Option<u32>,
  pub max_frame_size: Option<u32>,
  pub max_header_list_size: Option<u32>,
  /// Connection-level window
  pub initial_connection_window_size: Option<u32>,
}

impl H2Settings {
  /// The settings Chrome sends
  pub fn chrome() -> Self {
    Self {
      header_table_size: Some(65536),
      enable_push: Some(false),
      max_concurrent_streams: Some(1000),
      initial_window_size: Some(6291456),
      max_frame_size: None,
      max_header_list_size: Some(262144),
      initial_connection_window_size: Some(15728640),
    }
  }

  pub(crate) fn client_builder(&self) -> h2::client::Builder {
    let mut builder = h2::client::Builder::new();
    if let Some(size) = self.header_table_size {
      builder.header_table_size(size);
    }
    if let Some(push) = self.enable_push {
      builder.enable_push(push);
    }
    if let Some(max) = self.max_concurrent_streams {
      builder.max_concurrent_streams(max);
    }
    if let Some(size) = self.initial_window_size {
      builder.initial_window_size(size);
    }
    if let Some(size) = self.max_frame_size {
      builder.max_frame_size(size);
    }
    if let Some(size) = self.max_header_list_size {
      builder.max_header_list_size(size);
    }
    if let Some(size) = self.initial_connection_window_size {
      builder.initial_connection_window_size(size);
    }
    builder
  }
}

/// Impersonation profile for the upstream leg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintSpec {
  /// JA3 string describing the ClientHello to emit
  pub ja3: Option<String>,
  /// ALPN list to offer instead of the client's
  pub alpn: Option<Vec<String>>,
  /// HTTP/2 settings; their presence forces HTTP/2 re-origination
  pub h2: Option<H2Settings>,
}

impl FingerprintSpec {
  /// A profile with only HTTP/2 settings
  pub fn with_h2(settings: H2Settings) -> Self {
    Self {
      h2: Some(settings),
      ..Default::default()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.ja3.is_none() && self.alpn.is_none() && self.h2.is_none()
  }
}

/// An established upstream TLS session
pub struct Handshake {
  pub stream: BoxStream,
  /// Protocol the server selected, if any
  pub alpn: Option<Vec<u8>>,
}

/// Client-side TLS engine used towards origins
#[async_trait::async_trait]
pub trait TlsHandshaker: Send + Sync {
  async fn client_handshake(
    &self,
    stream: BoxStream,
    server_name: &str,
    alpn: &[Vec<u8>],
    spec: Option<&FingerprintSpec>,
  ) -> Result<Handshake>;
}

/// Default handshaker backed by rustls. Origin certificates are not verified.
pub struct RustlsHandshaker {
  timeout: Duration,
}

impl RustlsHandshaker {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }

  fn config(&self, alpn: &[Vec<u8>]) -> Result<ClientConfig> {
    let mut config = tls::insecure_client_config()?;
    config.alpn_protocols = alpn.to_vec();
    Ok(config)
  }
}

impl Default for RustlsHandshaker {
  fn default() -> Self {
    Self::new(Duration::from_secs(30))
  }
}

#[async_trait::async_trait]
impl TlsHandshaker for RustlsHandshaker {
  async fn client_handshake(
    &self,
    stream: BoxStream,
    server_name: &str,
    alpn: &[Vec<u8>],
    spec: Option<&FingerprintSpec>,
  ) -> Result<Handshake> {
    if let Some(ja3) = spec.and_then(|s| s.ja3.as_deref()) {
      tracing::trace!(ja3, "ClientHello shaping not available in rustls, using defaults");
    }
    let connector = TlsConnector::from(Arc::new(self.config(alpn)?));
    let name = ServerName::try_from(bare_host(server_name).to_string())
      .map_err(|e| Error::tls(format!("invalid server name {}: {}", server_name, e)))?;
    let tls = tokio::time::timeout(self.timeout, connector.connect(name, stream))
      .await
      .map_err(|_| Error::upstream(format!("TLS handshake with {} timed out", server_name)))?
      .map_err(|e| Error::upstream(format!("TLS handshake with {} failed: {}", server_name, e)))?;
    let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    Ok(Handshake {
      stream: Box::new(tls),
      alpn,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_spec() {
    assert!(FingerprintSpec::default().is_empty());
    assert!(!FingerprintSpec::with_h2(H2Settings::chrome()).is_empty());
  }

  #[test]
  fn test_h2_builder_accepts_all_settings() {
    let _builder = H2Settings::chrome().client_builder();
  }
}
