//! rustls configuration helpers

use crate::error::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

/// The process-wide provider, or ring when none was installed
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client config that accepts any server certificate
pub(crate) fn insecure_client_config() -> Result<ClientConfig> {
  let config = ClientConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("invalid TLS versions: {}", e)))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  Ok(config)
}

/// Server config presenting `chain` and offering exactly `alpn`
pub(crate) fn server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  alpn: Vec<Vec<u8>>,
) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| Error::tls(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = alpn;
  Ok(config)
}

/// Parse a PEM certificate chain and private key
pub(crate) fn parse_identity(
  cert_pem: &str,
  key_pem: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
  let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::certificate(format!("Failed to parse certificate PEM: {}", e)))?;
  if chain.is_empty() {
    return Err(Error::certificate("No certificate found in PEM"));
  }
  let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
    .map_err(|e| Error::certificate(format!("Failed to parse key PEM: {}", e)))?
    .ok_or_else(|| Error::certificate("No private key found in PEM"))?;
  Ok((chain, key))
}

/// Certificate verifier that trusts every server
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    crypto_provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}
