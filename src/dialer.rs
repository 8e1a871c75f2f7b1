//! Outbound connections: TCP dialing, DNS caching and proxy chaining

use crate::config::DialOptions;
use crate::conn::{bare_host, BoxStream, Scheme};
use crate::error::{Error, Result};
use crate::fingerprint::ALPN_HTTP11;
use crate::tls;
use crate::socks5::TargetAddr;
use crate::upstream::{self, parse_ip, split_host_port, ForwardProxy};
use moka::future::Cache;
use socket2::{Domain, Protocol, Socket as RawSocket, TcpKeepalive, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Opens byte streams towards targets
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
  /// Plain connection to `addr` (`host:port`)
  async fn dial(&self, addr: &str) -> Result<BoxStream>;

  /// Connection to `target` (`host:port`), through `proxy` when given.
  ///
  /// `host` is the request's Host value, for dialers that route on it.
  async fn dial_with_proxy(
    &self,
    scheme: Scheme,
    target: &str,
    host: &str,
    proxy: Option<&ForwardProxy>,
  ) -> Result<BoxStream>;
}

/// Default dialer built on tokio sockets configured through socket2
pub struct TcpDialer {
  options: DialOptions,
  dns_cache: Cache<String, Arc<Vec<IpAddr>>>,
}

impl TcpDialer {
  pub fn new(options: DialOptions) -> Self {
    let dns_cache = Cache::builder()
      .max_capacity(4096)
      .time_to_live(options.dns_cache_ttl)
      .build();
    Self { options, dns_cache }
  }

  /// Resolve a host through overrides, the cache, then the system resolver
  pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Some(ip) = parse_ip(host) {
      return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let key = host.to_ascii_lowercase();
    if let Some(ip) = self.options.dns_overrides.get(&key) {
      return Ok(vec![SocketAddr::new(*ip, port)]);
    }
    if let Some(cached) = self.dns_cache.get(&key).await {
      return Ok(cached.iter().map(|ip| SocketAddr::new(*ip, port)).collect());
    }
    let resolved: Vec<IpAddr> = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| Error::upstream(format!("failed to resolve {}: {}", host, e)))?
      .map(|addr| addr.ip())
      .collect();
    if resolved.is_empty() {
      return Err(Error::upstream(format!("no addresses for {}", host)));
    }
    tracing::trace!(host, addrs = ?resolved, "resolved");
    self.dns_cache.insert(key, Arc::new(resolved.clone())).await;
    Ok(resolved.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
  }

  /// Connect to one resolved address
  pub async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    if let Some(idle) = self.options.keepalive {
      raw_socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    if let Some(local) = self.options.local_addr {
      if local.is_ipv4() == addr.is_ipv4() {
        raw_socket.bind(&SocketAddr::new(local, 0).into())?;
      }
    }
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.options.nodelay {
      socket.set_nodelay(true)?;
    }
    tokio::time::timeout(self.options.connect_timeout, socket.connect(addr))
      .await
      .map_err(|_| Error::upstream(format!("connect to {} timed out", addr)))?
      .map_err(|e| Error::upstream(format!("connect to {} failed: {}", addr, e)))
  }

  async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream> {
    let mut last = None;
    for addr in self.resolve(host, port).await? {
      match self.connect_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last = Some(e),
      }
    }
    Err(last.unwrap_or_else(|| Error::upstream(format!("no addresses for {}", host))))
  }

  async fn through_proxy(&self, target: &str, proxy: &ForwardProxy) -> Result<BoxStream> {
    match proxy {
      ForwardProxy::Http {
        host,
        port,
        https,
        auth,
        ..
      } => {
        let stream: BoxStream = Box::new(self.connect_host(host, *port).await?);
        let stream = if *https {
          let mut config = tls::insecure_client_config()?;
          config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
          let name = proxy_server_name(host)?;
          let tls = TlsConnector::from(Arc::new(config))
            .connect(name, stream)
            .await
            .map_err(|e| Error::upstream(format!("TLS to proxy {} failed: {}", host, e)))?;
          Box::new(tls) as BoxStream
        } else {
          stream
        };
        upstream::http_connect(stream, target, auth.as_ref()).await
      }
      ForwardProxy::Socks5 {
        host,
        port,
        auth,
        remote_dns,
        ..
      } => {
        let (target_host, target_port) = split_host_port(target)?;
        let socks_target = match parse_ip(&target_host) {
          Some(ip) => TargetAddr::Ip(SocketAddr::new(ip, target_port)),
          None if *remote_dns => TargetAddr::Domain(target_host, target_port),
          None => {
            let addr = self
              .resolve(&target_host, target_port)
              .await?
              .into_iter()
              .next()
              .ok_or_else(|| Error::upstream(format!("no addresses for {}", target_host)))?;
            TargetAddr::Ip(addr)
          }
        };
        let stream: BoxStream = Box::new(self.connect_host(host, *port).await?);
        upstream::socks5_connect(stream, socks_target, auth.as_ref()).await
      }
    }
  }
}

/// TLS name of an HTTPS proxy; IPv6 literals arrive bracketed from the URI
fn proxy_server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(bare_host(host).to_string())
    .map_err(|e| Error::upstream(format!("invalid proxy host {}: {}", host, e)))
}

impl Default for TcpDialer {
  fn default() -> Self {
    Self::new(DialOptions::default())
  }
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
  async fn dial(&self, addr: &str) -> Result<BoxStream> {
    let (host, port) = split_host_port(addr)?;
    Ok(Box::new(self.connect_host(&host, port).await?))
  }

  async fn dial_with_proxy(
    &self,
    scheme: Scheme,
    target: &str,
    host: &str,
    proxy: Option<&ForwardProxy>,
  ) -> Result<BoxStream> {
    match proxy {
      None => {
        tracing::debug!(%scheme, target, host, "dialing");
        self.dial(target).await
      }
      Some(proxy) => {
        tracing::debug!(%scheme, target, host, proxy = %proxy.uri(), "dialing through proxy");
        self.through_proxy(target, proxy).await
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_dns_override_and_literal() {
    let mut overrides = HashMap::new();
    overrides.insert("origin.test".to_string(), "127.0.0.1".parse().unwrap());
    let dialer = TcpDialer::new(DialOptions {
      dns_overrides: overrides,
      ..Default::default()
    });
    let addrs = dialer.resolve("Origin.Test", 8080).await.unwrap();
    assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    let addrs = dialer.resolve("::1", 443).await.unwrap();
    assert_eq!(addrs, vec!["[::1]:443".parse().unwrap()]);
  }

  #[test]
  fn test_proxy_server_name_strips_brackets() {
    assert!(matches!(
      proxy_server_name("[::1]").unwrap(),
      ServerName::IpAddress(_)
    ));
    assert!(matches!(
      proxy_server_name("proxy.test").unwrap(),
      ServerName::DnsName(_)
    ));
  }

  #[tokio::test]
  async fn test_dial_through_http_proxy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 1024];
      let n = stream.read(&mut buf).await.unwrap();
      let head = String::from_utf8_lossy(&buf[..n]).to_string();
      assert!(head.starts_with("CONNECT origin.test:443 HTTP/1.1\r\n"));
      assert!(head.contains("Proxy-Authorization: Basic dTpw"));
      stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .unwrap();
      stream.write_all(b"tunnel").await.unwrap();
    });

    let dialer = TcpDialer::default();
    let proxy = ForwardProxy::parse(&format!("http://u:p@{}", proxy_addr)).unwrap();
    let mut stream = dialer
      .dial_with_proxy(Scheme::Https, "origin.test:443", "origin.test", Some(&proxy))
      .await
      .unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel");
  }
}
