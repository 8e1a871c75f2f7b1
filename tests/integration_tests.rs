//! End-to-end sessions through a live proxy against local origins

mod common;

use bytes::Bytes;
use common::*;
use futures::{SinkExt, StreamExt};
use mitm_relay::{
  encode_basic_auth, FrameInterceptor, MitmRequest, MitmResponse, ProxyConfig, ProxyServer,
  RequestInterceptor, ResponseInterceptor, Result, WsDirection, WsFrame,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message;

const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nServer: origin\r\nContent-Length: 5\r\n\r\nhello";

#[derive(Default)]
struct CountingInterceptor {
  requests: AtomicUsize,
  responses: AtomicUsize,
}

#[async_trait::async_trait]
impl RequestInterceptor for CountingInterceptor {
  async fn intercept_request(&self, mut request: MitmRequest) -> Result<Option<MitmRequest>> {
    self.requests.fetch_add(1, Ordering::SeqCst);
    request
      .request_mut()
      .headers_mut()
      .insert("x-intercepted", http::HeaderValue::from_static("1"));
    Ok(Some(request))
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for CountingInterceptor {
  async fn intercept_response(&self, mut response: MitmResponse) -> Result<Option<MitmResponse>> {
    self.responses.fetch_add(1, Ordering::SeqCst);
    response
      .response_mut()
      .headers_mut()
      .insert("x-tagged", http::HeaderValue::from_static("1"));
    Ok(Some(response))
  }
}

#[derive(Default)]
struct FrameRecorder {
  frames: Mutex<Vec<WsFrame>>,
}

#[async_trait::async_trait]
impl FrameInterceptor for FrameRecorder {
  async fn intercept_frame(&self, frame: WsFrame) -> Result<Option<WsFrame>> {
    self.frames.lock().unwrap().push(frame.clone());
    Ok(Some(frame))
  }
}

async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
  let mut buf = Vec::new();
  tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf))
    .await
    .unwrap()
    .unwrap();
  buf
}

#[tokio::test]
async fn test_http_get_passes_each_hook_once() {
  let origin = http_origin(ORIGIN_RESPONSE).await;
  let counter = Arc::new(CountingInterceptor::default());
  let server = start_proxy(
    ProxyServer::builder()
      .request_interceptor(counter.clone())
      .response_interceptor(counter.clone()),
  )
  .await;

  let mut client = TcpStream::connect(server.addr()).await.unwrap();
  let request = format!(
    "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let response = read_to_end(&mut client).await;
  let text = String::from_utf8_lossy(&response);

  assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
  assert!(text.ends_with("hello"), "{text}");
  assert!(text.contains("x-tagged: 1\r\n"), "{text}");
  assert_eq!(counter.requests.load(Ordering::SeqCst), 1);
  assert_eq!(counter.responses.load(Ordering::SeqCst), 1);
  server.close();
}

#[tokio::test]
async fn test_socks5_plain_http_is_byte_exact() {
  let origin = http_origin(ORIGIN_RESPONSE).await;
  let server = start_proxy(ProxyServer::builder()).await;

  let mut client = TcpStream::connect(server.addr()).await.unwrap();
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut choice = [0u8; 2];
  client.read_exact(&mut choice).await.unwrap();
  assert_eq!(choice, [0x05, 0x00]);

  let std::net::SocketAddr::V4(v4) = origin else {
    panic!("origin bound to IPv6");
  };
  let mut connect = vec![0x05, 0x01, 0x00, 0x01];
  connect.extend_from_slice(&v4.ip().octets());
  connect.extend_from_slice(&v4.port().to_be_bytes());
  client.write_all(&connect).await.unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..2], &[0x05, 0x00]);

  client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
  let response = read_to_end(&mut client).await;
  assert_eq!(response, ORIGIN_RESPONSE);
  server.close();
}

#[tokio::test]
async fn test_socks5_rejects_client_without_password_method() {
  let server = start_proxy(
    ProxyServer::builder().config(ProxyConfig::default().with_credentials("user", "pass")),
  )
  .await;

  let mut client = TcpStream::connect(server.addr()).await.unwrap();
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut choice = [0u8; 2];
  client.read_exact(&mut choice).await.unwrap();
  assert_eq!(choice, [0x05, 0xff]);
  server.close();
}

#[tokio::test]
async fn test_proxy_credentials_are_enforced() {
  let origin = http_origin(ORIGIN_RESPONSE).await;
  let server = start_proxy(
    ProxyServer::builder().config(ProxyConfig::default().with_credentials("user", "pass")),
  )
  .await;

  let mut client = TcpStream::connect(server.addr()).await.unwrap();
  let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();
  let response = read_to_end(&mut client).await;
  assert_eq!(
    response,
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n"
  );

  let credentials = encode_basic_auth("user", "pass");
  let mut client = TcpStream::connect(server.addr()).await.unwrap();
  let request = format!(
    "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: {}\r\n\r\n",
    credentials.to_str().unwrap()
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let response = read_to_end(&mut client).await;
  assert_eq!(response, ORIGIN_RESPONSE);
  server.close();
}

#[tokio::test]
async fn test_vpn_mode_refuses_plain_sessions() {
  let mut config = ProxyConfig::default();
  config.vpn = true;
  let server = start_proxy(ProxyServer::builder().config(config)).await;

  let mut client = TcpStream::connect(server.addr()).await.unwrap();
  client
    .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
    .await
    .unwrap();
  let response = read_to_end(&mut client).await;
  assert!(response.is_empty());
  server.close();
}

#[tokio::test]
async fn test_connect_without_hooks_is_a_plain_tunnel() {
  let (origin, origin_cert) = tls_origin_with_cert(&[b"h2", b"http/1.1"]).await;
  let server = start_proxy(ProxyServer::builder()).await;
  let ca = server.ca_cert_pem().unwrap().to_string();

  // the origin's own certificate comes through untouched
  let (stream, status) = connect_tunnel(server.addr(), &origin.to_string()).await;
  assert_eq!(status, "HTTP/1.1 200 Connection established");
  let tls = tls_client_for_origin(stream, origin_cert, &[b"h2", b"http/1.1"]).await;
  assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));
  assert_eq!(h2_get(tls).await, b"hello h2");

  // so the proxy CA does not validate it
  let (stream, _) = connect_tunnel(server.addr(), &origin.to_string()).await;
  assert!(try_tls_client(stream, &ca, &[b"h2"]).await.is_err());
  server.close();
}

#[tokio::test]
async fn test_mitm_mirrors_http11_only_origin() {
  let origin = tls_origin(&[b"http/1.1"]).await;
  let counter = Arc::new(CountingInterceptor::default());
  let server = start_proxy(ProxyServer::builder().request_interceptor(counter.clone())).await;
  let ca = server.ca_cert_pem().unwrap().to_string();

  let (stream, status) = connect_tunnel(server.addr(), &origin.to_string()).await;
  assert_eq!(status, "HTTP/1.1 200 Connection established");
  let mut tls = tls_client(stream, &ca, &[b"h2", b"http/1.1"]).await;
  assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut tls).await;
  assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
  let mut body = [0u8; 8];
  tls.read_exact(&mut body).await.unwrap();
  assert_eq!(&body, b"hello h1");
  assert_eq!(counter.requests.load(Ordering::SeqCst), 1);
  server.close();
}

#[tokio::test]
async fn test_mitm_h2_on_both_legs() {
  let origin = tls_origin(&[b"h2", b"http/1.1"]).await;
  let counter = Arc::new(CountingInterceptor::default());
  let server = start_proxy(ProxyServer::builder().request_interceptor(counter.clone())).await;
  let ca = server.ca_cert_pem().unwrap().to_string();

  let (stream, _) = connect_tunnel(server.addr(), &origin.to_string()).await;
  let tls = tls_client(stream, &ca, &[b"h2"]).await;
  assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

  let (sender, connection) = h2::client::handshake(tls).await.unwrap();
  tokio::spawn(connection);
  let mut sender = sender.ready().await.unwrap();
  for _ in 0..2 {
    let request = http::Request::get("https://localhost/").body(()).unwrap();
    let (response, _) = sender.send_request(request, true).unwrap();
    let response = response.await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
      let chunk: Bytes = chunk.unwrap();
      let _ = body.flow_control().release_capacity(chunk.len());
      collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"hello h2");
    sender = sender.ready().await.unwrap();
  }
  assert_eq!(counter.requests.load(Ordering::SeqCst), 2);
  server.close();
}

#[tokio::test]
async fn test_absolute_https_request_bridged_to_h2_origin() {
  let origin = tls_origin(&[b"h2", b"http/1.1"]).await;
  let mut config = ProxyConfig::default();
  config
    .dial
    .dns_overrides
    .insert("localhost".to_string(), "127.0.0.1".parse().unwrap());
  let server = start_proxy(ProxyServer::builder().config(config)).await;

  let mut client = TcpStream::connect(server.addr()).await.unwrap();
  let target = format!("localhost:{}", origin.port());
  let request = format!(
    "GET https://{target}/ HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n"
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let response = read_to_end(&mut client).await;
  let text = String::from_utf8_lossy(&response);
  assert!(text.starts_with("HTTP/1.1 200"), "{text}");
  assert!(text.contains("hello h2"), "{text}");
  server.close();
}

#[tokio::test]
async fn test_websocket_messages_reach_frame_hook() {
  let origin = ws_origin().await;
  let recorder = Arc::new(FrameRecorder::default());
  let server = start_proxy(ProxyServer::builder().frame_interceptor(recorder.clone())).await;

  let stream = TcpStream::connect(server.addr()).await.unwrap();
  let (mut ws, response) = tokio_tungstenite::client_async(format!("ws://{origin}/chat"), stream)
    .await
    .unwrap();
  assert_eq!(response.status(), http::StatusCode::SWITCHING_PROTOCOLS);

  ws.send(Message::Text("ping".to_string().into())).await.unwrap();
  let reply = tokio::time::timeout(Duration::from_secs(10), ws.next())
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  assert_eq!(reply, Message::Text("pong".to_string().into()));
  ws.close(None).await.unwrap();

  let frames = recorder.frames.lock().unwrap().clone();
  assert!(frames.len() >= 2);
  assert_eq!(frames[0].direction, WsDirection::Send);
  assert_eq!(frames[0].as_text(), Some("ping"));
  assert_eq!(frames[1].direction, WsDirection::Recv);
  assert_eq!(frames[1].as_text(), Some("pong"));
  server.close();
}

async fn recv_datagram(socket: &UdpSocket) -> Option<Vec<u8>> {
  let mut buf = vec![0u8; 2048];
  match tokio::time::timeout(Duration::from_millis(500), socket.recv(&mut buf)).await {
    Ok(Ok(n)) => Some(buf[..n].to_vec()),
    _ => None,
  }
}

#[tokio::test]
async fn test_socks5_udp_associate_relays_one_flow() {
  let (echo, echo_hits) = udp_echo_origin().await;
  let (other, other_hits) = udp_echo_origin().await;
  let server = start_proxy(ProxyServer::builder()).await;

  let (mut control, relay) = socks5_udp_associate(server.addr()).await;
  assert_eq!(relay.ip(), server.addr().ip());
  assert_ne!(relay.port(), 0);

  let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  client.connect(relay).await.unwrap();
  client.send(&udp_datagram(echo, b"one")).await.unwrap();
  assert_eq!(recv_datagram(&client).await.unwrap(), udp_datagram(echo, b"one"));

  // the first target is pinned
  client.send(&udp_datagram(other, b"two")).await.unwrap();
  client.send(&udp_datagram(echo, b"three")).await.unwrap();
  assert_eq!(recv_datagram(&client).await.unwrap(), udp_datagram(echo, b"three"));
  assert_eq!(other_hits.load(Ordering::SeqCst), 0);

  // so is the first client source
  let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  intruder.connect(relay).await.unwrap();
  intruder.send(&udp_datagram(echo, b"four")).await.unwrap();
  assert!(recv_datagram(&intruder).await.is_none());
  assert_eq!(echo_hits.load(Ordering::SeqCst), 2);

  // closing the control connection ends the association
  control.shutdown().await.unwrap();
  assert!(read_to_end(&mut control).await.is_empty());
  let _ = client.send(&udp_datagram(echo, b"five")).await;
  assert!(recv_datagram(&client).await.is_none());
  assert_eq!(echo_hits.load(Ordering::SeqCst), 2);
  server.close();
}

#[tokio::test]
async fn test_socks5_udp_domain_target_ends_association() {
  let server = start_proxy(ProxyServer::builder()).await;
  let (mut control, relay) = socks5_udp_associate(server.addr()).await;

  let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  let mut packet = vec![0x00, 0x00, 0x00, 0x03, 6];
  packet.extend_from_slice(b"a.test");
  packet.extend_from_slice(&53u16.to_be_bytes());
  packet.extend_from_slice(b"query");
  client.send_to(&packet, relay).await.unwrap();

  assert!(read_to_end(&mut control).await.is_empty());
  server.close();
}
