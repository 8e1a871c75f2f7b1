//! HTTP/2 relays: an HTTP/1.1 client onto an HTTP/2 origin, and HTTP/2 on
//! both legs with every exchange passing through the hooks.

use crate::bridge::{next_request, wants_close};
use crate::conn::{guarded, ProxyConn};
use crate::error::{Error, Result};
use crate::fingerprint::H2Settings;
use crate::http1::{Framing, MAX_BODY_SIZE};
use crate::server::Shared;
use bytes::{Bytes, BytesMut};
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::RecvStream;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Headers HTTP/2 forbids
const CONNECTION_HEADERS: [&str; 6] = [
  "connection",
  "keep-alive",
  "proxy-connection",
  "transfer-encoding",
  "upgrade",
  "proxy-authorization",
];

fn strip_connection_headers(headers: &mut HeaderMap) {
  for name in CONNECTION_HEADERS {
    headers.remove(name);
  }
  let te_trailers = headers
    .get("te")
    .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"trailers"));
  if !te_trailers {
    headers.remove("te");
  }
}

/// Make `content-length` agree with the buffered body
fn sync_content_length(headers: &mut HeaderMap, body: &Bytes) {
  if !body.is_empty() || headers.contains_key(CONTENT_LENGTH) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  }
}

async fn collect_body(mut body: RecvStream) -> Result<Bytes> {
  let mut buf = BytesMut::new();
  while let Some(chunk) = body.data().await {
    let chunk = chunk?;
    let _ = body.flow_control().release_capacity(chunk.len());
    if buf.len() + chunk.len() > MAX_BODY_SIZE {
      return Err(Error::protocol("HTTP/2 body exceeds the buffering limit"));
    }
    buf.extend_from_slice(&chunk);
  }
  Ok(buf.freeze())
}

/// Open an HTTP/2 client session on the server leg and drive it in the background
async fn connect_upstream(server: ProxyConn) -> Result<SendRequest<Bytes>> {
  let settings = server
    .option()
    .fingerprint
    .as_ref()
    .and_then(|spec| spec.h2.clone())
    .unwrap_or_else(H2Settings::default);
  let token = server.token().clone();
  let idle = server.idle_timeout();
  let (io, _) = server.into_parts();
  let (sender, connection) = guarded(&token, idle, settings.client_builder().handshake(io)).await?;
  tokio::spawn(async move {
    tokio::select! {
      _ = token.cancelled() => {}
      res = connection => {
        if let Err(e) = res {
          tracing::debug!("upstream HTTP/2 connection ended: {}", e);
        }
        token.cancel();
      }
    }
  });
  Ok(sender)
}

/// One request/response exchange on an HTTP/2 client session
async fn round_trip(sender: &SendRequest<Bytes>, request: Request<Bytes>) -> Result<Response<Bytes>> {
  let (mut parts, body) = request.into_parts();
  strip_connection_headers(&mut parts.headers);
  parts.headers.remove(HOST);
  sync_content_length(&mut parts.headers, &body);
  parts.version = Version::HTTP_2;

  let mut sender = sender.clone().ready().await?;
  let end_of_stream = body.is_empty();
  let (response, mut stream) = sender.send_request(Request::from_parts(parts, ()), end_of_stream)?;
  if !end_of_stream {
    stream.send_data(body, true)?;
  }
  let (parts, body) = response.await?.into_parts();
  let body = collect_body(body).await?;
  Ok(Response::from_parts(parts, body))
}

/// HTTP/1.1 client, HTTP/2 server
pub(crate) async fn http12(shared: &Arc<Shared>, mut client: ProxyConn, server: ProxyConn) -> Result<()> {
  let token = client.token().clone();
  let idle = client.idle_timeout();
  let destination = client.option().target().unwrap_or_default();
  let sender = connect_upstream(server).await?;

  while let Some(request) = next_request(shared, &mut client).await? {
    let request = shared
      .handler
      .forward_request(client.peer_addr(), &destination, request)
      .await?;
    let method = request.method().clone();
    let uri = request.uri().clone();
    let closing = wants_close(request.version(), request.headers());

    let response = guarded(&token, idle, round_trip(&sender, request)).await?;
    let mut response = shared
      .handler
      .forward_response(client.peer_addr(), &destination, &method, &uri, response)
      .await?;
    *response.version_mut() = Version::HTTP_11;
    let framing = Framing::bridged(&method, &response);
    client.write_response(&response, framing).await?;
    if closing {
      break;
    }
  }
  client.close();
  Ok(())
}

/// Everything an HTTP/2 exchange task needs
#[derive(Clone)]
struct Exchange {
  shared: Arc<Shared>,
  sender: Arc<Mutex<SendRequest<Bytes>>>,
  source: Option<SocketAddr>,
  destination: String,
  token: CancellationToken,
  idle: Duration,
}

impl Exchange {
  async fn run(self, request: Request<RecvStream>, mut respond: SendResponse<Bytes>) {
    let result = self.relay(request, &mut respond).await;
    match result {
      Ok(()) => {}
      Err(Error::Blocked(_)) => respond.send_reset(h2::Reason::REFUSED_STREAM),
      Err(e) => {
        tracing::debug!(destination = %self.destination, "HTTP/2 exchange failed: {}", e);
        respond.send_reset(h2::Reason::INTERNAL_ERROR);
        self.token.cancel();
      }
    }
  }

  async fn relay(&self, request: Request<RecvStream>, respond: &mut SendResponse<Bytes>) -> Result<()> {
    let (parts, body) = request.into_parts();
    let body = guarded(&self.token, self.idle, collect_body(body)).await?;
    let request = Request::from_parts(parts, body);

    // exchanges reach the hooks and the upstream one at a time, in arrival order
    let sender = self.sender.lock().await;
    let request = self
      .shared
      .handler
      .forward_request(self.source, &self.destination, request)
      .await?;
    let method: Method = request.method().clone();
    let uri = request.uri().clone();
    let response = guarded(&self.token, self.idle, round_trip(&sender, request)).await?;
    let response = self
      .shared
      .handler
      .forward_response(self.source, &self.destination, &method, &uri, response)
      .await?;

    let (mut parts, body) = response.into_parts();
    strip_connection_headers(&mut parts.headers);
    sync_content_length(&mut parts.headers, &body);
    let end_of_stream = body.is_empty();
    let mut stream = respond.send_response(Response::from_parts(parts, ()), end_of_stream)?;
    if !end_of_stream {
      stream.send_data(body, true)?;
    }
    drop(sender);
    Ok(())
  }
}

/// HTTP/2 on both legs
pub(crate) async fn http22(shared: &Arc<Shared>, client: ProxyConn, server: ProxyConn) -> Result<()> {
  let token = client.token().clone();
  let idle = client.idle_timeout();
  let source = client.peer_addr();
  let destination = client.option().target().unwrap_or_default();
  let sender = connect_upstream(server).await?;

  let (io, _) = client.into_parts();
  let mut connection = guarded(&token, idle, h2::server::handshake(io)).await?;
  let exchange = Exchange {
    shared: shared.clone(),
    sender: Arc::new(Mutex::new(sender)),
    source,
    destination,
    token: token.clone(),
    idle,
  };

  let mut tasks = JoinSet::new();
  let result = loop {
    let accepted = tokio::select! {
      _ = token.cancelled() => break Ok(()),
      accepted = connection.accept() => accepted,
    };
    match accepted {
      Some(Ok((request, respond))) => {
        tasks.spawn(exchange.clone().run(request, respond));
      }
      Some(Err(e)) => {
        let e = Error::from(e);
        break if e.is_closed() { Ok(()) } else { Err(e) };
      }
      None => break Ok(()),
    }
    while tasks.try_join_next().is_some() {}
  };
  token.cancel();
  tasks.shutdown().await;
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_strip_connection_headers() {
    let mut headers = HeaderMap::new();
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
    headers.insert("te", HeaderValue::from_static("gzip"));
    headers.insert("x-kept", HeaderValue::from_static("1"));
    strip_connection_headers(&mut headers);
    assert_eq!(headers.len(), 1);

    headers.insert("te", HeaderValue::from_static("trailers"));
    strip_connection_headers(&mut headers);
    assert!(headers.contains_key("te"));
  }

  #[test]
  fn test_sync_content_length() {
    let mut headers = HeaderMap::new();
    sync_content_length(&mut headers, &Bytes::new());
    assert!(!headers.contains_key(CONTENT_LENGTH));
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("99"));
    sync_content_length(&mut headers, &Bytes::from_static(b"abc"));
    assert_eq!(headers[CONTENT_LENGTH], "3");
  }
}
