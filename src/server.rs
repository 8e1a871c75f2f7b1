//! Listener, per-connection dispatch and the server builder

use crate::auth::Access;
use crate::ca::{CertificateAuthority, CertificateManager, LeafMinter};
use crate::classify::Protocol;
use crate::config::{CertSource, ProxyConfig, UpstreamProxy};
use crate::conn::{bare_host, ProxyConn, Scheme, Side};
use crate::dialer::{Dialer, TcpDialer};
use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintSpec, RustlsHandshaker, TlsHandshaker};
use crate::http_proxy;
use crate::interceptor::{
  AuthVerifier, ConnectInterceptor, FingerprintSelector, FrameInterceptor, InterceptorHandler,
  RequestInterceptor, ResponseInterceptor,
};
use crate::mitm;
use crate::socks5;
use crate::upstream::ForwardProxy;
use bytes::Bytes;
use futures::FutureExt;
use http::{Request, Uri};
use std::backtrace::Backtrace;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Read-only state every connection task shares
pub(crate) struct Shared {
  pub(crate) config: ProxyConfig,
  pub(crate) access: Access,
  pub(crate) handler: InterceptorHandler,
  pub(crate) dialer: Arc<dyn Dialer>,
  pub(crate) handshaker: Arc<dyn TlsHandshaker>,
  pub(crate) minter: Arc<dyn LeafMinter>,
  pub(crate) listen_addr: SocketAddr,
}

impl Shared {
  /// Whether `host:port` is this listener
  pub(crate) fn is_loop(&self, host: &str, port: u16) -> bool {
    if port != self.listen_addr.port() {
      return false;
    }
    let host = bare_host(host);
    if host.eq_ignore_ascii_case("localhost") {
      return true;
    }
    match host.parse::<IpAddr>() {
      Ok(ip) => ip.is_loopback() || ip == self.listen_addr.ip(),
      Err(_) => false,
    }
  }

  /// Next-hop proxy for `target`
  pub(crate) async fn forward_proxy(&self, target: &Uri) -> Result<Option<ForwardProxy>> {
    match &self.config.upstream_proxy {
      UpstreamProxy::None => Ok(None),
      UpstreamProxy::Static(proxy) => Ok(Some(proxy.clone())),
      UpstreamProxy::Dynamic(resolver) => resolver.resolve(target).await,
    }
  }

  /// Impersonation profile for a request: the selector's, else the default
  pub(crate) async fn select_fingerprint(&self, request: &Request<Bytes>) -> Option<Arc<FingerprintSpec>> {
    let spec = match self.handler.select_fingerprint(request).await {
      Some(spec) => Some(spec),
      None => self.config.fingerprint.clone(),
    };
    spec.filter(|s| !s.is_empty()).map(Arc::new)
  }

  /// Dial the stabilized target of `client` and build the server leg
  pub(crate) async fn connect_upstream(&self, client: &ProxyConn, host: &str) -> Result<ProxyConn> {
    let option = client.option();
    let scheme = option.scheme().unwrap_or(Scheme::Http);
    let target = option
      .target()
      .ok_or_else(|| Error::protocol("connection has no target"))?;
    let uri: Uri = format!("{}://{}", scheme, target)
      .parse()
      .map_err(|e| Error::protocol(format!("invalid target {}: {}", target, e)))?;
    let proxy = self.forward_proxy(&uri).await?;
    let stream = self
      .dialer
      .dial_with_proxy(scheme, &target, host, proxy.as_ref())
      .await?;
    Ok(
      ProxyConn::new(stream, Side::Server, client.token().clone(), client.idle_timeout())
        .with_option(option.clone()),
    )
  }
}

/// Multi-protocol intercepting proxy server
pub struct ProxyServer {
  listener: TcpListener,
  shared: Arc<Shared>,
  shutdown: CancellationToken,
  ca: Option<Arc<CertificateManager>>,
}

impl ProxyServer {
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::new()
  }

  /// Bound listen address
  pub fn addr(&self) -> SocketAddr {
    self.shared.listen_addr
  }

  /// CA certificate in PEM format, when the built-in certificate engine is used
  ///
  /// This certificate should be installed in the client's trust store
  pub fn ca_cert_pem(&self) -> Option<&str> {
    self.ca.as_ref().map(|manager| manager.ca().ca_cert_pem())
  }

  /// Token that stops the server and every connection when cancelled
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// Stop accepting and cancel in-flight connections
  pub fn close(&self) {
    self.shutdown.cancel();
  }

  /// Accept connections until [`ProxyServer::close`] is called
  pub async fn run(&self) -> Result<()> {
    tracing::info!(addr = %self.addr(), "proxy listening");
    loop {
      let accepted = tokio::select! {
        _ = self.shutdown.cancelled() => break,
        accepted = self.listener.accept() => accepted,
      };
      let (stream, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
          tracing::error!("Failed to accept connection: {}", e);
          continue;
        }
      };
      let shared = self.shared.clone();
      let token = self.shutdown.child_token();
      tokio::spawn(async move {
        let debug = shared.config.debug;
        let guarded = AssertUnwindSafe(handle_connection(shared, stream, peer, token.clone()));
        let result = match guarded.catch_unwind().await {
          Ok(result) => result,
          Err(panic) => {
            let reason = panic
              .downcast_ref::<&str>()
              .map(|s| s.to_string())
              .or_else(|| panic.downcast_ref::<String>().cloned())
              .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::internal(format!("connection task panicked: {}", reason)))
          }
        };
        token.cancel();
        match result {
          Ok(()) => tracing::trace!(%peer, "connection finished"),
          Err(e) if e.is_closed() => tracing::trace!(%peer, "connection closed: {}", e),
          Err(e) if debug => {
            tracing::error!(%peer, "connection error: {}\n{}", e, Backtrace::force_capture())
          }
          Err(e) => tracing::debug!(%peer, "connection error: {}", e),
        }
      });
    }
    tracing::info!(addr = %self.addr(), "proxy stopped");
    Ok(())
  }
}

/// Classify the first byte and hand the connection to its front end
async fn handle_connection(
  shared: Arc<Shared>,
  stream: TcpStream,
  peer: SocketAddr,
  token: CancellationToken,
) -> Result<()> {
  let local = stream.local_addr().ok();
  let _ = stream.set_nodelay(true);
  if !shared.access.admits(Some(peer.ip())) {
    return Err(Error::auth(format!("{} is not on the allow-list", peer)));
  }
  let mut client = ProxyConn::new(
    Box::new(stream),
    Side::Client,
    token,
    shared.config.idle_timeout,
  )
  .with_addrs(Some(peer), local);

  let protocol = Protocol::classify(client.peek_byte().await?);
  tracing::debug!(%peer, %protocol, "accepted connection");
  if shared.config.vpn && protocol != Protocol::Tls {
    client.close();
    return Err(Error::auth(format!(
      "{} sent {} but only TLS-wrapped sessions are accepted",
      peer, protocol
    )));
  }
  match protocol {
    Protocol::Socks5 => socks5::serve(&shared, client).await,
    Protocol::Tls => mitm::serve_tls(&shared, client).await,
    Protocol::Http => http_proxy::serve(&shared, client).await,
  }
}

/// Builder for [`ProxyServer`]
pub struct ProxyServerBuilder {
  config: ProxyConfig,
  handler: InterceptorHandler,
  dialer: Option<Arc<dyn Dialer>>,
  handshaker: Option<Arc<dyn TlsHandshaker>>,
  minter: Option<Arc<dyn LeafMinter>>,
}

impl Default for ProxyServerBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ProxyServerBuilder {
  pub fn new() -> Self {
    Self {
      config: ProxyConfig::default(),
      handler: InterceptorHandler::new(),
      dialer: None,
      handshaker: None,
      minter: None,
    }
  }

  /// Replace the whole configuration
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = config;
    self
  }

  pub fn bind(mut self, bind: impl Into<String>) -> Self {
    self.config.bind = bind.into();
    self
  }

  pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
    self.handler.add_request_interceptor(interceptor);
    self
  }

  pub fn response_interceptor(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
    self.handler.add_response_interceptor(interceptor);
    self
  }

  pub fn frame_interceptor(mut self, interceptor: Arc<dyn FrameInterceptor>) -> Self {
    self.handler.add_frame_interceptor(interceptor);
    self
  }

  pub fn connect_interceptor(mut self, interceptor: Arc<dyn ConnectInterceptor>) -> Self {
    self.handler.set_connect_interceptor(interceptor);
    self
  }

  pub fn auth_verifier(mut self, verifier: Arc<dyn AuthVerifier>) -> Self {
    self.handler.set_auth_verifier(verifier);
    self
  }

  pub fn fingerprint_selector(mut self, selector: Arc<dyn FingerprintSelector>) -> Self {
    self.handler.set_fingerprint_selector(selector);
    self
  }

  /// Outbound connection factory; defaults to [`TcpDialer`] over `config.dial`
  pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
    self.dialer = Some(dialer);
    self
  }

  /// Upstream TLS engine; defaults to [`RustlsHandshaker`]
  pub fn tls_handshaker(mut self, handshaker: Arc<dyn TlsHandshaker>) -> Self {
    self.handshaker = Some(handshaker);
    self
  }

  /// Leaf certificate source; defaults to a [`CertificateManager`] over `config.certificates`
  pub fn leaf_minter(mut self, minter: Arc<dyn LeafMinter>) -> Self {
    self.minter = Some(minter);
    self
  }

  /// Load the CA, bind the listener and assemble the server
  pub async fn build(self) -> Result<ProxyServer> {
    let config = self.config;
    let (minter, ca) = match self.minter {
      Some(minter) => (minter, None),
      None => {
        let authority = match &config.certificates {
          CertSource::Generate => CertificateAuthority::generate()?,
          CertSource::Storage(path) => CertificateAuthority::load_or_generate(path).await?,
          CertSource::CaPem { cert, key } => CertificateAuthority::from_pem(cert, key)?,
        };
        let manager = Arc::new(CertificateManager::new(authority));
        (manager.clone() as Arc<dyn LeafMinter>, Some(manager))
      }
    };
    let dialer = self
      .dialer
      .unwrap_or_else(|| Arc::new(TcpDialer::new(config.dial.clone())));
    let handshaker = self
      .handshaker
      .unwrap_or_else(|| Arc::new(RustlsHandshaker::new(config.handshake_timeout)));

    let listener = TcpListener::bind(&config.bind).await?;
    let listen_addr = listener.local_addr()?;
    let shared = Shared {
      access: Access::from_config(&config),
      config,
      handler: self.handler,
      dialer,
      handshaker,
      minter,
      listen_addr,
    };
    Ok(ProxyServer {
      listener,
      shared: Arc::new(shared),
      shutdown: CancellationToken::new(),
      ca,
    })
  }
}
