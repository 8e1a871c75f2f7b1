//! Certificate Authority (CA) management
//!
//! Leaf certificates for intercepted hosts are minted on demand, signed by a
//! CA that is either generated in memory, persisted in a storage directory, or
//! supplied by the embedding application.

use crate::conn::bare_host;
use crate::error::{Error, Result};
use crate::tls;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::ServerConfig;

/// Certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (6 months)
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// A minted leaf: `[leaf, ca]` chain and the leaf key
#[derive(Debug)]
pub struct LeafCert {
  pub chain: Vec<CertificateDer<'static>>,
  pub key: PrivateKeyDer<'static>,
}

impl LeafCert {
  /// TLS server config presenting this leaf and offering exactly `alpn`
  pub fn server_config(&self, alpn: Vec<Vec<u8>>) -> Result<ServerConfig> {
    tls::server_config(self.chain.clone(), self.key.clone_key(), alpn)
  }
}

/// Source of leaf certificates
#[async_trait::async_trait]
pub trait LeafMinter: Send + Sync {
  /// Leaf for a DNS name or IP literal
  async fn mint_leaf(&self, name: &str) -> Result<Arc<LeafCert>>;
}

/// Certificate Authority for generating certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  ca_cert_pem: String,
}

impl CertificateAuthority {
  /// Generate a fresh CA that lives only in memory
  pub fn generate() -> Result<Self> {
    let (cert_pem, key_pair) = Self::generate_ca()?;
    Self::from_parts(&cert_pem, key_pair)
  }

  /// Use a CA supplied as PEM
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate(format!("Failed to parse CA key: {}", e)))?;
    Self::from_parts(cert_pem, key_pair)
  }

  /// Load the CA stored in `storage_path`, generating and saving one if absent
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref();
    if !storage_path.exists() {
      fs::create_dir_all(storage_path).await?;
    }
    let cert_path = storage_path.join("ca_cert.pem");
    let key_path = storage_path.join("ca_key.pem");

    if cert_path.exists() && key_path.exists() {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      return Self::from_pem(&cert_pem, &key_pem);
    }

    let (cert_pem, key_pair) = Self::generate_ca()?;
    fs::write(&cert_path, cert_pem.as_bytes()).await?;
    fs::write(&key_path, key_pair.serialize_pem().as_bytes()).await?;
    tracing::info!(path = %cert_path.display(), "generated new CA certificate");
    Self::from_parts(&cert_pem, key_pair)
  }

  fn from_parts(cert_pem: &str, key_pair: KeyPair) -> Result<Self> {
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("Failed to create issuer from CA cert: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("No certificate found in PEM"))?
      .map_err(|e| Error::certificate(format!("Failed to parse PEM: {}", e)))?;
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  fn generate_ca() -> Result<(String, KeyPair)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "mitm-relay CA");
    dn.push(DnType::OrganizationName, "mitm-relay");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    // 10 years
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("Failed to generate CA: {}", e)))?;
    Ok((cert.pem(), key_pair))
  }

  /// Sign a leaf for `name`. IP literals get an IP SAN, anything else a DNS SAN.
  pub fn mint(&self, name: &str) -> Result<LeafCert> {
    let name = bare_host(name);
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;

    params.subject_alt_names = match name.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(name.try_into().map_err(|_| {
        Error::certificate(format!("Invalid domain name: {}", name))
      })?)],
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("Failed to sign leaf for {}: {}", name, e)))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok(LeafCert {
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key,
    })
  }

  /// CA certificate in PEM format, for installing into client trust stores
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

/// Mints leaves through a [`CertificateAuthority`] and caches them per name
pub struct CertificateManager {
  ca: CertificateAuthority,
  cert_cache: Cache<String, Arc<LeafCert>>,
}

impl CertificateManager {
  pub fn new(ca: CertificateAuthority) -> Self {
    let cert_cache = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Self { ca, cert_cache }
  }

  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Get or generate a leaf for the given name
  pub async fn get_server_cert(&self, name: &str) -> Result<Arc<LeafCert>> {
    let key = bare_host(name).to_ascii_lowercase();
    if let Some(cached) = self.cert_cache.get(&key).await {
      return Ok(cached);
    }
    let leaf = Arc::new(self.ca.mint(&key)?);
    self.cert_cache.insert(key, leaf.clone()).await;
    Ok(leaf)
  }
}

#[async_trait::async_trait]
impl LeafMinter for CertificateManager {
  async fn mint_leaf(&self, name: &str) -> Result<Arc<LeafCert>> {
    self.get_server_cert(name).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_leaf_is_cached_per_name() {
    let manager = CertificateManager::new(CertificateAuthority::generate().unwrap());
    let first = manager.get_server_cert("example.com").await.unwrap();
    let second = manager.get_server_cert("EXAMPLE.com").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.chain.len(), 2);
    assert_eq!(&first.chain[1], manager.ca().ca_cert_der());
  }

  #[test]
  fn test_ip_literal_gets_ip_san() {
    let ca = CertificateAuthority::generate().unwrap();
    let leaf = ca.mint("[::1]").unwrap();
    assert!(leaf.server_config(vec![b"h2".to_vec()]).is_ok());
    let leaf = ca.mint("127.0.0.1").unwrap();
    assert!(leaf.server_config(Vec::new()).is_ok());
  }

  #[test]
  fn test_from_pem_rejects_garbage() {
    let key = KeyPair::generate().unwrap().serialize_pem();
    assert!(CertificateAuthority::from_pem("not pem", &key).is_err());
  }

  #[tokio::test]
  async fn test_storage_is_reused() {
    let dir = std::env::temp_dir().join(format!("mitm-relay-ca-{}", rand::random::<u32>()));
    let first = CertificateAuthority::load_or_generate(&dir).await.unwrap();
    let second = CertificateAuthority::load_or_generate(&dir).await.unwrap();
    assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
    let _ = std::fs::remove_dir_all(&dir);
  }
}
