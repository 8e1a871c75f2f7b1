//! Relay between the client and server legs
//!
//! [`copy_main`] decides whether a session is intercepted at all;
//! [`copy_http`] picks a [`Strategy`] from what each leg negotiated and which
//! hooks are registered, then drives the matching pump.

use crate::conn::{ProxyConn, Scheme, WsHandshake};
use crate::error::{Error, Result};
use crate::h2_bridge;
use crate::http1::Framing;
use crate::interceptor::Capabilities;
use crate::mitm;
use crate::server::Shared;
use crate::websocket;
use bytes::Bytes;
use http::header::{CONNECTION, SEC_WEBSOCKET_EXTENSIONS};
use http::{HeaderMap, Request, StatusCode, Version};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// How a session's HTTP traffic is relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// HTTP/2 client and HTTP/1.1 server; never downgraded
  Unsupported,
  /// HTTP/1.1 client bridged onto an HTTP/2 server
  Http12,
  /// HTTP/2 on both legs, re-originated so hooks see each exchange
  Http2Intercept,
  /// Opaque byte copy
  Raw,
  /// HTTP/1.1 on both legs, one exchange at a time
  Http11Intercept,
}

impl Strategy {
  /// Pick the relay for a pair of legs. `h2_fingerprint` is set when the
  /// upstream must be re-originated with specific HTTP/2 settings.
  pub fn select(client_h2: bool, server_h2: bool, caps: Capabilities, h2_fingerprint: bool) -> Self {
    match (client_h2, server_h2) {
      (true, false) => Strategy::Unsupported,
      (false, true) => Strategy::Http12,
      (true, true) if caps.http || h2_fingerprint => Strategy::Http2Intercept,
      (true, true) => Strategy::Raw,
      (false, false) if caps.any() => Strategy::Http11Intercept,
      (false, false) => Strategy::Raw,
    }
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::Unsupported => "unsupported",
      Strategy::Http12 => "http1-http2",
      Strategy::Http2Intercept => "http2-intercept",
      Strategy::Raw => "raw",
      Strategy::Http11Intercept => "http1-intercept",
    };
    f.write_str(name)
  }
}

/// Relay a session, intercepting TLS when anything needs to see inside it
pub(crate) async fn copy_main(shared: &Arc<Shared>, client: ProxyConn, server: ProxyConn) -> Result<()> {
  if client.option().scheme() != Some(Scheme::Https) {
    return copy_http(shared, client, server).await;
  }
  let caps = shared.handler.capabilities();
  let connect = client.option().is_connect();
  if connect && !caps.any() && client.option().fingerprint.is_none() {
    return copy_http(shared, client, server).await;
  }
  if connect {
    let (client, server) = mitm::intercept(shared, client, server).await?;
    copy_http(shared, client, server).await
  } else {
    let server = mitm::forward_https(shared, server).await?;
    copy_http(shared, client, server).await
  }
}

/// Relay HTTP (or opaque bytes) between two established legs
pub(crate) async fn copy_http(shared: &Arc<Shared>, client: ProxyConn, server: ProxyConn) -> Result<()> {
  let caps = shared.handler.capabilities();
  let h2_fingerprint = server
    .option()
    .fingerprint
    .as_ref()
    .is_some_and(|spec| spec.h2.is_some());
  let strategy = Strategy::select(
    client.option().http2,
    server.option().http2,
    caps,
    h2_fingerprint,
  );
  tracing::debug!(%strategy, peer = ?client.peer_addr(), target = ?client.option().target(), "relaying");
  match strategy {
    Strategy::Unsupported => {
      client.close();
      Err(Error::unsupported(
        "client negotiated h2 but the upstream only speaks HTTP/1.1",
      ))
    }
    Strategy::Http12 => h2_bridge::http12(shared, client, server).await,
    Strategy::Http2Intercept => h2_bridge::http22(shared, client, server).await,
    Strategy::Raw => copy_raw(client, server).await,
    Strategy::Http11Intercept => copy_http11(shared, client, server, caps).await,
  }
}

/// Next request on the client leg: the queued one first. `None` once the
/// client is done.
pub(crate) async fn next_request(
  shared: &Shared,
  client: &mut ProxyConn,
) -> Result<Option<Request<Bytes>>> {
  if let Some(request) = client.take_queued() {
    return Ok(Some(request));
  }
  match client
    .read_request(shared.handler.connect_interceptor())
    .await
  {
    Ok(request) => Ok(request),
    Err(e) if e.is_closed() => Ok(None),
    Err(e) => Err(e),
  }
}

/// Whether the peer asked for the connection to end after this message
pub(crate) fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  let connection = headers
    .get(CONNECTION)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default();
  let has = |token: &str| {
    connection
      .split(',')
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  };
  has("close") || (version == Version::HTTP_10 && !has("keep-alive"))
}

async fn copy_http11(
  shared: &Arc<Shared>,
  mut client: ProxyConn,
  mut server: ProxyConn,
  caps: Capabilities,
) -> Result<()> {
  let destination = client.option().target().unwrap_or_default();
  while let Some(request) = next_request(shared, &mut client).await? {
    let mut request = shared
      .handler
      .forward_request(client.peer_addr(), &destination, request)
      .await?;
    if caps.frames && WsHandshake::from_headers(request.headers()).is_some() {
      request.headers_mut().remove(SEC_WEBSOCKET_EXTENSIONS);
    }
    let method = request.method().clone();
    let uri = request.uri().clone();
    let closing = wants_close(request.version(), request.headers());

    server.write_request(&request).await?;
    let response = server.read_response(&method).await?;
    let response = shared
      .handler
      .forward_response(client.peer_addr(), &destination, &method, &uri, response)
      .await?;
    client
      .write_response(&response, Framing::relay(&method, &response))
      .await?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
      client.option_mut().websocket = server.option().websocket.clone();
      if caps.frames && server.option().websocket.is_some() {
        return websocket::relay(shared, client, server).await;
      }
      return copy_raw(client, server).await;
    }
    if closing || wants_close(response.version(), response.headers()) {
      break;
    }
  }
  client.close();
  Ok(())
}

/// Last time any byte moved, shared by both directions of a raw copy
#[derive(Clone)]
struct Activity {
  start: Instant,
  last: Arc<AtomicU64>,
}

impl Activity {
  fn new() -> Self {
    Self {
      start: Instant::now(),
      last: Arc::new(AtomicU64::new(0)),
    }
  }

  fn touch(&self) {
    let now = self.start.elapsed().as_millis() as u64;
    self.last.store(now, Ordering::Relaxed);
  }

  fn idle_for(&self) -> Duration {
    let last = Duration::from_millis(self.last.load(Ordering::Relaxed));
    self.start.elapsed().saturating_sub(last)
  }
}

async fn pipe<R, W>(mut reader: R, mut writer: W, token: CancellationToken, activity: Activity) -> Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; COPY_BUF_SIZE];
  let mut total = 0u64;
  let result = loop {
    let n = tokio::select! {
      _ = token.cancelled() => break Err(Error::Closed),
      n = reader.read(&mut buf) => match n {
        Ok(n) => n,
        Err(e) => break Err(e.into()),
      },
    };
    if n == 0 {
      let _ = writer.shutdown().await;
      break Ok(total);
    }
    activity.touch();
    let written = tokio::select! {
      _ = token.cancelled() => break Err(Error::Closed),
      res = async {
        writer.write_all(&buf[..n]).await?;
        writer.flush().await
      } => res,
    };
    if let Err(e) = written {
      break Err(e.into());
    }
    total += n as u64;
  };
  token.cancel();
  result
}

async fn watch_idle(token: CancellationToken, idle: Duration, activity: Activity) {
  loop {
    let remaining = idle.saturating_sub(activity.idle_for());
    if remaining.is_zero() {
      tracing::trace!("raw relay idle, closing");
      token.cancel();
      return;
    }
    tokio::select! {
      _ = token.cancelled() => return,
      _ = tokio::time::sleep(remaining) => {}
    }
  }
}

fn ended(result: Result<u64>) -> Result<()> {
  match result {
    Ok(_) => Ok(()),
    Err(e) if e.is_closed() => Ok(()),
    Err(e) => Err(e),
  }
}

/// Copy bytes both ways until either side finishes, writing any queued
/// request first
pub(crate) async fn copy_raw(mut client: ProxyConn, mut server: ProxyConn) -> Result<()> {
  if let Some(request) = client.take_queued() {
    server.write_request(&request).await?;
  }
  let token = client.token().clone();
  let idle = client.idle_timeout();
  let (client_io, _) = client.into_parts();
  let (server_io, _) = server.into_parts();
  let (client_read, client_write) = tokio::io::split(client_io);
  let (server_read, server_write) = tokio::io::split(server_io);

  let activity = Activity::new();
  let upload = tokio::spawn(pipe(
    client_read,
    server_write,
    token.clone(),
    activity.clone(),
  ));
  let (download, ()) = tokio::join!(
    pipe(server_read, client_write, token.clone(), activity.clone()),
    watch_idle(token.clone(), idle, activity),
  );
  let upload = upload
    .await
    .map_err(|e| Error::internal(format!("relay task failed: {}", e)))?;
  ended(upload)?;
  ended(download)
}
