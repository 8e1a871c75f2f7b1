//! TLS interception
//!
//! A CONNECT tunnel is intercepted in two phases. The client's ClientHello is
//! read first, so the upstream handshake can offer the same ALPN protocols.
//! The client-facing handshake then completes with a minted leaf whose ALPN
//! is exactly what the upstream selected, so both legs always agree on
//! whether they speak HTTP/2.

use crate::conn::{ConnMeta, ProxyConn};
use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintSpec, ALPN_H2, ALPN_HTTP11};
use crate::http_proxy;
use crate::server::Shared;
use crate::tls;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;

async fn within<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  tokio::time::timeout(timeout, fut)
    .await
    .map_err(|_| Error::tls(format!("{} timed out", what)))?
    .map_err(|e| Error::tls(format!("{} failed: {}", what, e)))
}

/// Protocols to offer upstream.
///
/// The fingerprint's list replaces the client's when set; only `h2` and
/// `http/1.1` survive, and `h2` only if the client offered it.
pub(crate) fn upstream_alpn(client: &[Vec<u8>], spec: Option<&FingerprintSpec>) -> Vec<Vec<u8>> {
  let client_h2 = client.iter().any(|p| p == ALPN_H2);
  let candidates: Vec<Vec<u8>> = match spec.and_then(|s| s.alpn.as_ref()) {
    Some(alpn) => alpn.iter().map(|p| p.as_bytes().to_vec()).collect(),
    None => client.to_vec(),
  };
  let mut offer: Vec<Vec<u8>> = Vec::new();
  for proto in candidates {
    let wanted = (proto == ALPN_H2 && client_h2) || proto == ALPN_HTTP11;
    if wanted && !offer.contains(&proto) {
      offer.push(proto);
    }
  }
  offer
}

/// Client-facing ALPN: exactly the upstream-negotiated protocol, or nothing
pub(crate) fn client_alpn(upstream: Option<&[u8]>) -> Vec<Vec<u8>> {
  upstream.map(|p| vec![p.to_vec()]).unwrap_or_default()
}

/// Intercept a CONNECT tunnel, returning both legs re-wrapped in TLS
pub(crate) async fn intercept(
  shared: &Arc<Shared>,
  client: ProxyConn,
  server: ProxyConn,
) -> Result<(ProxyConn, ProxyConn)> {
  let timeout = shared.config.handshake_timeout;
  let (client_io, mut client_meta) = client.into_parts();
  let (server_io, mut server_meta) = server.into_parts();
  let token = client_meta.token.clone();

  let start = match within(
    timeout,
    "reading ClientHello",
    LazyConfigAcceptor::new(Acceptor::default(), client_io),
  )
  .await
  {
    Ok(start) => start,
    Err(e) => {
      token.cancel();
      return Err(e);
    }
  };
  let hello = start.client_hello();
  let sni = hello
    .server_name()
    .map(str::to_string)
    .or_else(|| client_meta.option.host().map(str::to_string))
    .ok_or_else(|| Error::tls("no server name for interception"))?;
  let offered: Vec<Vec<u8>> = hello
    .alpn()
    .map(|protocols| protocols.map(|p| p.to_vec()).collect())
    .unwrap_or_default();
  let spec = server_meta.option.fingerprint.clone();
  let offer = upstream_alpn(&offered, spec.as_deref());
  tracing::debug!(%sni, offered = offered.len(), "intercepting TLS");

  let handshake = tokio::time::timeout(
    timeout,
    shared
      .handshaker
      .client_handshake(server_io, &sni, &offer, spec.as_deref()),
  )
  .await
  .map_err(|_| Error::upstream(format!("TLS handshake with {} timed out", sni)))
  .and_then(|res| res);
  let handshake = match handshake {
    Ok(handshake) => handshake,
    Err(e) => {
      // dropping `start` aborts the client handshake
      token.cancel();
      return Err(e);
    }
  };

  let leaf = shared.minter.mint_leaf(&sni).await?;
  let config = leaf.server_config(client_alpn(handshake.alpn.as_deref()))?;
  let client_tls = match within(timeout, "client TLS handshake", start.into_stream(Arc::new(config))).await {
    Ok(tls) => tls,
    Err(e) => {
      token.cancel();
      return Err(e);
    }
  };

  client_meta.option.http2 = client_tls.get_ref().1.alpn_protocol() == Some(ALPN_H2);
  server_meta.option.http2 = handshake.alpn.as_deref() == Some(ALPN_H2);
  tracing::debug!(
    %sni,
    client_h2 = client_meta.option.http2,
    server_h2 = server_meta.option.http2,
    "TLS interception established"
  );
  Ok((
    ProxyConn::from_parts(Box::new(client_tls), client_meta),
    ProxyConn::from_parts(handshake.stream, server_meta),
  ))
}

/// TLS on the server leg only, for plain requests with an `https://` target
pub(crate) async fn forward_https(shared: &Arc<Shared>, server: ProxyConn) -> Result<ProxyConn> {
  let name = server
    .option()
    .host()
    .map(str::to_string)
    .ok_or_else(|| Error::protocol("https request without host"))?;
  let offer = if server.option().websocket.is_some() {
    vec![ALPN_HTTP11.to_vec()]
  } else {
    vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
  };
  let (io, mut meta) = server.into_parts();
  let spec = meta.option.fingerprint.clone();
  let handshake = tokio::time::timeout(
    shared.config.handshake_timeout,
    shared
      .handshaker
      .client_handshake(io, &name, &offer, spec.as_deref()),
  )
  .await
  .map_err(|_| Error::upstream(format!("TLS handshake with {} timed out", name)))
  .and_then(|res| res);
  let handshake = match handshake {
    Ok(handshake) => handshake,
    Err(e) => {
      meta.token.cancel();
      return Err(e);
    }
  };
  meta.option.http2 = handshake.alpn.as_deref() == Some(ALPN_H2);
  Ok(ProxyConn::from_parts(handshake.stream, meta))
}

/// Terminate a TLS-wrapped proxy session and serve HTTP proxying inside it
pub(crate) async fn serve_tls(shared: &Arc<Shared>, client: ProxyConn) -> Result<()> {
  let timeout = shared.config.handshake_timeout;
  let (io, meta) = client.into_parts();
  let start = match within(
    timeout,
    "reading proxy ClientHello",
    LazyConfigAcceptor::new(Acceptor::default(), io),
  )
  .await
  {
    Ok(start) => start,
    Err(e) => {
      meta.token.cancel();
      return Err(e);
    }
  };
  let sni = start.client_hello().server_name().map(str::to_string);
  let config = match proxy_identity(shared, sni.as_deref(), &meta).await {
    Ok(config) => config,
    Err(e) => {
      meta.token.cancel();
      return Err(e);
    }
  };
  let tls = match within(timeout, "proxy TLS handshake", start.into_stream(Arc::new(config))).await {
    Ok(tls) => tls,
    Err(e) => {
      meta.token.cancel();
      return Err(e);
    }
  };
  tracing::debug!(peer = ?meta.peer_addr, sni = ?sni, "TLS-wrapped proxy session");
  let inner = ProxyConn::from_parts(Box::new(tls), meta);
  http_proxy::serve(shared, inner).await
}

/// Server identity for the proxy itself: configured, or minted for the SNI,
/// the configured server name, or the listener IP
async fn proxy_identity(
  shared: &Shared,
  sni: Option<&str>,
  meta: &ConnMeta,
) -> Result<tokio_rustls::rustls::ServerConfig> {
  let alpn = vec![ALPN_HTTP11.to_vec()];
  if let Some(identity) = &shared.config.server_identity {
    let (chain, key) = tls::parse_identity(&identity.cert_pem, &identity.key_pem)?;
    return tls::server_config(chain, key, alpn);
  }
  let name = sni
    .map(str::to_string)
    .or_else(|| shared.config.server_name.clone())
    .or_else(|| meta.local_addr.map(|a| a.ip().to_string()))
    .unwrap_or_else(|| shared.listen_addr.ip().to_string());
  shared.minter.mint_leaf(&name).await?.server_config(alpn)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn protos(list: &[&[u8]]) -> Vec<Vec<u8>> {
    list.iter().map(|p| p.to_vec()).collect()
  }

  #[test]
  fn test_upstream_alpn_mirrors_client() {
    let offer = upstream_alpn(&protos(&[b"h2", b"http/1.1"]), None);
    assert_eq!(offer, protos(&[b"h2", b"http/1.1"]));
    let offer = upstream_alpn(&protos(&[b"http/1.1", b"spdy/3"]), None);
    assert_eq!(offer, protos(&[b"http/1.1"]));
    assert!(upstream_alpn(&[], None).is_empty());
  }

  #[test]
  fn test_fingerprint_cannot_add_h2() {
    let spec = FingerprintSpec {
      alpn: Some(vec!["h2".to_string(), "http/1.1".to_string()]),
      ..Default::default()
    };
    let offer = upstream_alpn(&protos(&[b"http/1.1"]), Some(&spec));
    assert_eq!(offer, protos(&[b"http/1.1"]));
    let offer = upstream_alpn(&protos(&[b"h2"]), Some(&spec));
    assert_eq!(offer, protos(&[b"h2", b"http/1.1"]));
  }

  #[test]
  fn test_client_alpn_is_exact() {
    assert_eq!(client_alpn(Some(b"h2")), protos(&[b"h2"]));
    assert!(client_alpn(None).is_empty());
  }
}
