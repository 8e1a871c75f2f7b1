//! Proxy configuration

use crate::conn::DEFAULT_IDLE_TIMEOUT;
use crate::fingerprint::FingerprintSpec;
use crate::upstream::{ForwardProxy, ProxyResolver};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where the CA that signs minted leaves comes from
#[derive(Debug, Clone, Default)]
pub enum CertSource {
  /// Fresh CA kept in memory for the lifetime of the server
  #[default]
  Generate,
  /// CA persisted in a directory, generated on first use
  Storage(PathBuf),
  /// CA supplied as PEM
  CaPem { cert: String, key: String },
}

/// Explicit certificate presented to clients that wrap the proxy session in TLS
#[derive(Clone)]
pub struct ServerIdentity {
  pub cert_pem: String,
  pub key_pem: String,
}

impl fmt::Debug for ServerIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServerIdentity")
      .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
      .finish_non_exhaustive()
  }
}

/// Next-hop proxy for outbound connections
#[derive(Clone, Default)]
pub enum UpstreamProxy {
  /// Connect to targets directly
  #[default]
  None,
  /// Always go through this proxy
  Static(ForwardProxy),
  /// Ask a resolver per target
  Dynamic(Arc<dyn ProxyResolver>),
}

impl fmt::Debug for UpstreamProxy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      UpstreamProxy::None => f.write_str("None"),
      UpstreamProxy::Static(proxy) => f.debug_tuple("Static").field(&proxy.uri()).finish(),
      UpstreamProxy::Dynamic(_) => f.write_str("Dynamic(..)"),
    }
  }
}

/// Socket options for outbound connections
#[derive(Debug, Clone)]
pub struct DialOptions {
  pub connect_timeout: Duration,
  /// `SO_KEEPALIVE` idle time; `None` leaves keepalive off
  pub keepalive: Option<Duration>,
  /// Local address to bind before connecting
  pub local_addr: Option<IpAddr>,
  /// Fixed host to address mappings consulted before DNS
  pub dns_overrides: HashMap<String, IpAddr>,
  /// How long resolved addresses stay cached
  pub dns_cache_ttl: Duration,
  pub nodelay: bool,
}

impl Default for DialOptions {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(10),
      keepalive: Some(Duration::from_secs(30)),
      local_addr: None,
      dns_overrides: HashMap::new(),
      dns_cache_ttl: Duration::from_secs(60),
      nodelay: true,
    }
  }
}

/// Configuration for the proxy server
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Listen address, `:0` picks a free port
  pub bind: String,
  /// Basic auth user; credentials are enforced only when both parts are set
  pub username: Option<String>,
  pub password: Option<String>,
  /// Sources admitted without credentials
  pub allow_list: Vec<IpAddr>,
  /// Skip the allow-list and credential checks entirely
  pub disable_verify: bool,
  /// Accept only TLS-wrapped proxy sessions
  pub vpn: bool,
  /// CA for minted leaves
  pub certificates: CertSource,
  /// Certificate for TLS-wrapped proxy sessions; minted when absent
  pub server_identity: Option<ServerIdentity>,
  /// Name to mint the proxy certificate for when the client sends no SNI
  pub server_name: Option<String>,
  pub upstream_proxy: UpstreamProxy,
  pub dial: DialOptions,
  /// Default impersonation profile for https targets
  pub fingerprint: Option<FingerprintSpec>,
  pub idle_timeout: Duration,
  /// Bound on each half of the MITM handshake
  pub handshake_timeout: Duration,
  /// Log connection failures with backtraces
  pub debug: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      bind: "127.0.0.1:0".to_string(),
      username: None,
      password: None,
      allow_list: Vec::new(),
      disable_verify: false,
      vpn: false,
      certificates: CertSource::default(),
      server_identity: None,
      server_name: None,
      upstream_proxy: UpstreamProxy::None,
      dial: DialOptions::default(),
      fingerprint: None,
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
      handshake_timeout: Duration::from_secs(30),
      debug: false,
    }
  }
}

impl ProxyConfig {
  /// Config listening on `bind` with everything else defaulted
  pub fn bind(bind: impl Into<String>) -> Self {
    Self {
      bind: bind.into(),
      ..Default::default()
    }
  }

  /// Require these credentials from sources outside the allow-list
  pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
    self.username = Some(username.into());
    self.password = Some(password.into());
    self
  }
}
