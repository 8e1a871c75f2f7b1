//! Framed connection shared by both legs of a relay session
//!
//! A [`ProxyConn`] owns one byte stream (plain TCP, TLS, or anything else that
//! is `AsyncRead + AsyncWrite`) behind a buffered reader, together with the
//! metadata the front ends learned about it. Every operation races the
//! session's cancellation token and is bounded by the idle timeout.

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintSpec;
use crate::http1::{self, Framing};
use crate::interceptor::ConnectInterceptor;
use bytes::Bytes;
use http::header::{HOST, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::uri::Authority;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Default idle timeout for a connection
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Any bidirectional byte stream a leg can be built from
///
/// `Sync` lets a `&ProxyConn` be held across an await inside a spawned task.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

/// Boxed byte stream
pub type BoxStream = Box<dyn AsyncStream>;

/// Which end of the relay a connection faces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
  /// Faces the proxy user
  Client,
  /// Faces the origin (or the next proxy)
  Server,
}

/// URI scheme of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
  Http,
  Https,
}

impl Scheme {
  pub fn as_str(&self) -> &'static str {
    match self {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }
  }

  pub fn default_port(&self) -> u16 {
    match self {
      Scheme::Http => 80,
      Scheme::Https => 443,
    }
  }
}

impl fmt::Display for Scheme {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// WebSocket upgrade observed on a leg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsHandshake {
  /// `Sec-WebSocket-Extensions` as sent or negotiated
  pub extensions: Option<String>,
  /// `Sec-WebSocket-Protocol` as sent or negotiated
  pub protocol: Option<String>,
}

impl WsHandshake {
  pub(crate) fn from_headers(headers: &http::HeaderMap) -> Option<Self> {
    let upgrade = headers.get(UPGRADE)?.to_str().ok()?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
      return None;
    }
    let text = |name| {
      headers
        .get(name)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(str::to_owned)
    };
    Some(Self {
      extensions: text(SEC_WEBSOCKET_EXTENSIONS),
      protocol: text(SEC_WEBSOCKET_PROTOCOL),
    })
  }
}

/// Metadata for one logical connection.
///
/// `host`, `scheme`, `port` and `method` are filled from the first request and
/// never overwritten afterwards. `http2`, `websocket` and `fingerprint` belong
/// to a single leg and change when that leg is re-wrapped.
#[derive(Debug, Clone, Default)]
pub struct ConnOption {
  host: Option<String>,
  scheme: Option<Scheme>,
  port: Option<u16>,
  method: Option<Method>,
  /// Leg negotiated `h2` through ALPN
  pub http2: bool,
  /// Leg carries (or is about to carry) a WebSocket session
  pub websocket: Option<WsHandshake>,
  /// Impersonation profile for upstream handshakes
  pub fingerprint: Option<Arc<FingerprintSpec>>,
}

impl ConnOption {
  pub fn host(&self) -> Option<&str> {
    self.host.as_deref()
  }

  pub fn scheme(&self) -> Option<Scheme> {
    self.scheme
  }

  pub fn port(&self) -> Option<u16> {
    self.port
  }

  pub fn method(&self) -> Option<&Method> {
    self.method.as_ref()
  }

  /// Whether the front-end request was a `CONNECT`
  pub fn is_connect(&self) -> bool {
    self.method.as_ref() == Some(&Method::CONNECT)
  }

  pub fn set_host(&mut self, host: impl Into<String>) {
    if self.host.is_none() {
      self.host = Some(host.into());
    }
  }

  pub fn set_scheme(&mut self, scheme: Scheme) {
    if self.scheme.is_none() {
      self.scheme = Some(scheme);
    }
  }

  pub fn set_port(&mut self, port: u16) {
    if self.port.is_none() {
      self.port = Some(port);
    }
  }

  pub fn set_method(&mut self, method: Method) {
    if self.method.is_none() {
      self.method = Some(method);
    }
  }

  /// `host:port` of the stabilized target
  pub fn target(&self) -> Option<String> {
    let host = self.host.as_deref()?;
    let port = self
      .port
      .or_else(|| self.scheme.map(|s| s.default_port()))?;
    Some(join_host_port(host, port))
  }

  /// Fill the stabilize-once fields from `request` and rewrite its URI to
  /// absolute form (authority form for `CONNECT`).
  pub fn stabilize(&mut self, request: &mut Request<Bytes>) -> Result<()> {
    self.set_method(request.method().clone());
    let is_connect = request.method() == Method::CONNECT;

    let authority = request
      .uri()
      .authority()
      .cloned()
      .or_else(|| {
        request
          .headers()
          .get(HOST)
          .and_then(|h| h.to_str().ok())
          .and_then(|h| h.parse::<Authority>().ok())
      })
      .or_else(|| self.host.as_deref().and_then(|h| h.parse::<Authority>().ok()))
      .ok_or_else(|| Error::protocol("request carries no target host"))?;

    let host = authority.host().to_string();
    self.set_host(host.clone());

    let scheme = match request.uri().scheme_str() {
      Some("https") => Scheme::Https,
      Some(_) => Scheme::Http,
      None if is_connect => Scheme::Https,
      None => self.scheme.unwrap_or(Scheme::Http),
    };
    self.set_scheme(scheme);

    let port = authority
      .port_u16()
      .or(self.port)
      .unwrap_or_else(|| scheme.default_port());
    self.set_port(port);

    let uri: Uri = if is_connect {
      join_host_port(&host, port)
        .parse()
        .map_err(|e| Error::protocol(format!("invalid CONNECT target: {}", e)))?
    } else {
      let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
      Uri::builder()
        .scheme(scheme.as_str())
        .authority(join_host_port(&host, port).as_str())
        .path_and_query(path)
        .build()?
    };
    *request.uri_mut() = uri;

    if !request.headers().contains_key(HOST) {
      let value = HeaderValue::from_str(authority.as_str())
        .map_err(|_| Error::protocol("invalid host"))?;
      request.headers_mut().insert(HOST, value);
    }
    Ok(())
  }
}

/// Join host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
  if host.contains(':') && !host.starts_with('[') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

/// Host without IPv6 brackets, as used for SNI and certificate names
pub fn bare_host(host: &str) -> &str {
  host.trim_start_matches('[').trim_end_matches(']')
}

/// Everything about a leg except its byte stream.
///
/// Carried across a TLS re-wrap with [`ProxyConn::into_parts`] and
/// [`ProxyConn::from_parts`].
#[derive(Debug, Clone)]
pub struct ConnMeta {
  pub side: Side,
  pub option: ConnOption,
  pub peer_addr: Option<SocketAddr>,
  pub local_addr: Option<SocketAddr>,
  pub idle_timeout: Duration,
  pub token: CancellationToken,
}

/// Run `op` under the idle timeout, racing the cancellation token.
///
/// Failure and timeout cancel the token, so the whole session closes.
pub(crate) async fn guarded<T, E, F>(token: &CancellationToken, idle: Duration, op: F) -> Result<T>
where
  F: Future<Output = std::result::Result<T, E>>,
  E: Into<Error>,
{
  if token.is_cancelled() {
    return Err(Error::Closed);
  }
  tokio::select! {
    _ = token.cancelled() => Err(Error::Closed),
    res = tokio::time::timeout(idle, op) => match res {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(e)) => {
        token.cancel();
        Err(e.into())
      }
      Err(_) => {
        token.cancel();
        Err(Error::Timeout)
      }
    },
  }
}

/// One leg of a relay session
pub struct ProxyConn {
  io: BufReader<BoxStream>,
  meta: ConnMeta,
  queued: Option<Request<Bytes>>,
}

impl fmt::Debug for ProxyConn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProxyConn")
      .field("meta", &self.meta)
      .field("queued", &self.queued.is_some())
      .finish()
  }
}

impl ProxyConn {
  /// Wrap a stream with empty metadata
  pub fn new(io: BoxStream, side: Side, token: CancellationToken, idle_timeout: Duration) -> Self {
    Self::from_parts(
      io,
      ConnMeta {
        side,
        option: ConnOption::default(),
        peer_addr: None,
        local_addr: None,
        idle_timeout,
        token,
      },
    )
  }

  /// Rebuild a leg around a new stream, keeping the carried metadata
  pub fn from_parts(io: BoxStream, meta: ConnMeta) -> Self {
    Self {
      io: BufReader::new(io),
      meta,
      queued: None,
    }
  }

  /// Split into the stream (with any buffered bytes) and the metadata
  pub fn into_parts(self) -> (BoxStream, ConnMeta) {
    (Box::new(self.io), self.meta)
  }

  pub fn with_addrs(mut self, peer: Option<SocketAddr>, local: Option<SocketAddr>) -> Self {
    self.meta.peer_addr = peer;
    self.meta.local_addr = local;
    self
  }

  pub fn with_option(mut self, option: ConnOption) -> Self {
    self.meta.option = option;
    self
  }

  pub fn side(&self) -> Side {
    self.meta.side
  }

  pub fn option(&self) -> &ConnOption {
    &self.meta.option
  }

  pub fn option_mut(&mut self) -> &mut ConnOption {
    &mut self.meta.option
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.meta.peer_addr
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.meta.local_addr
  }

  pub fn idle_timeout(&self) -> Duration {
    self.meta.idle_timeout
  }

  pub fn token(&self) -> &CancellationToken {
    &self.meta.token
  }

  /// Close the connection. Calling this more than once has no further effect.
  pub fn close(&self) {
    self.meta.token.cancel();
  }

  pub fn is_closed(&self) -> bool {
    self.meta.token.is_cancelled()
  }

  /// Queue a request to be relayed before anything else is read
  pub fn queue(&mut self, request: Request<Bytes>) {
    self.queued = Some(request);
  }

  pub fn take_queued(&mut self) -> Option<Request<Bytes>> {
    self.queued.take()
  }

  /// Look at the next byte without consuming it
  pub async fn peek_byte(&mut self) -> Result<u8> {
    let buf = guarded(&self.meta.token, self.meta.idle_timeout, self.io.fill_buf()).await?;
    match buf.first() {
      Some(b) => Ok(*b),
      None => Err(Error::Closed),
    }
  }

  pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
    guarded(
      &self.meta.token,
      self.meta.idle_timeout,
      self.io.read_exact(buf),
    )
    .await?;
    Ok(())
  }

  pub async fn read_u8(&mut self) -> Result<u8> {
    guarded(&self.meta.token, self.meta.idle_timeout, self.io.read_u8()).await
  }

  /// Read whatever is available; `0` means the peer closed
  pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
    guarded(&self.meta.token, self.meta.idle_timeout, self.io.read(buf)).await
  }

  pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
    let io = self.io.get_mut();
    guarded(&self.meta.token, self.meta.idle_timeout, async {
      io.write_all(buf).await?;
      io.flush().await
    })
    .await
  }

  /// Read the next request.
  ///
  /// `hook` sees the request before its URI is normalized. Returns `None` on a
  /// clean close at a message boundary.
  pub async fn read_request(
    &mut self,
    hook: Option<&dyn ConnectInterceptor>,
  ) -> Result<Option<Request<Bytes>>> {
    let parsed = guarded(
      &self.meta.token,
      self.meta.idle_timeout,
      http1::read_request(&mut self.io),
    )
    .await?;
    let Some(mut request) = parsed else {
      return Ok(None);
    };
    if let Some(hook) = hook {
      hook.on_request(&mut request).await?;
    }
    if let Some(ws) = WsHandshake::from_headers(request.headers()) {
      self.meta.option.websocket = Some(ws);
    }
    if let Err(e) = self.meta.option.stabilize(&mut request) {
      self.close();
      return Err(e);
    }
    Ok(Some(request))
  }

  /// Read the response to a request made with `method`
  pub async fn read_response(&mut self, method: &Method) -> Result<Response<Bytes>> {
    let response = guarded(
      &self.meta.token,
      self.meta.idle_timeout,
      http1::read_response(&mut self.io, method),
    )
    .await?;
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
      self.meta.option.websocket =
        WsHandshake::from_headers(response.headers()).or(self.meta.option.websocket.take());
    }
    Ok(response)
  }

  pub async fn write_request(&mut self, request: &Request<Bytes>) -> Result<()> {
    self.write_all(&http1::encode_request(request)).await
  }

  pub async fn write_response(&mut self, response: &Response<Bytes>, framing: Framing) -> Result<()> {
    self.write_all(&http1::encode_response(response, framing)).await
  }
}
