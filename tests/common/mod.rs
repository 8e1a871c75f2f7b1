//! Local origins and client helpers shared by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mitm_relay::{ProxyServer, ProxyServerBuilder};
use rcgen::{CertificateParams, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{client::TlsStream, TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::Message;

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the server and run it in the background
pub async fn start_proxy(builder: ProxyServerBuilder) -> Arc<ProxyServer> {
  init_tracing();
  let server = Arc::new(builder.build().await.unwrap());
  let running = server.clone();
  tokio::spawn(async move { running.run().await });
  server
}

/// Read until the end of an HTTP head
pub async fn read_head(stream: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await.unwrap() == 0 {
      break;
    }
    head.push(byte[0]);
  }
  head
}

/// Plain TCP origin that answers every connection with `response` and closes
pub async fn http_origin(response: &'static [u8]) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        read_head(&mut stream).await;
        stream.write_all(response).await.unwrap();
        stream.shutdown().await.ok();
      });
    }
  });
  addr
}

fn self_signed(name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
  let key = KeyPair::generate().unwrap();
  let cert = CertificateParams::new(vec![name.to_string()])
    .unwrap()
    .self_signed(&key)
    .unwrap();
  (
    CertificateDer::from(cert.der().to_vec()),
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
  )
}

/// TLS origin offering `alpn`. Speaks HTTP/2 when `h2` is negotiated and
/// HTTP/1.1 otherwise; both answer with a body naming the protocol.
pub async fn tls_origin(alpn: &[&[u8]]) -> SocketAddr {
  tls_origin_with_cert(alpn).await.0
}

/// [`tls_origin`] that also returns its self-signed certificate
pub async fn tls_origin_with_cert(alpn: &[&[u8]]) -> (SocketAddr, CertificateDer<'static>) {
  let (cert, key) = self_signed("localhost");
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.clone()], key)
    .unwrap();
  config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  let acceptor = TlsAcceptor::from(Arc::new(config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        if tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]) {
          let Ok(mut connection) = h2::server::handshake(tls).await else {
            return;
          };
          while let Some(Ok((_request, mut respond))) = connection.accept().await {
            let response = http::Response::builder()
              .status(200)
              .header("content-type", "text/plain")
              .body(())
              .unwrap();
            let mut body = respond.send_response(response, false).unwrap();
            body.send_data(Bytes::from_static(b"hello h2"), true).unwrap();
          }
        } else {
          loop {
            let head = read_head(&mut tls).await;
            if head.is_empty() {
              break;
            }
            tls
              .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 8\r\n\r\nhello h1")
              .await
              .unwrap();
          }
        }
      });
    }
  });
  (addr, cert)
}

/// WebSocket origin answering `ping` with `pong` and echoing anything else
pub async fn ws_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
          return;
        };
        while let Some(Ok(message)) = ws.next().await {
          let reply = match message {
            Message::Text(text) if text.as_str() == "ping" => Message::Text("pong".to_string().into()),
            Message::Close(_) => break,
            other => other,
          };
          if ws.send(reply).await.is_err() {
            break;
          }
        }
      });
    }
  });
  addr
}

/// Open a CONNECT tunnel through the proxy, returning the raw stream and the
/// proxy's status line
pub async fn connect_tunnel(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
  stream.write_all(request.as_bytes()).await.unwrap();
  let head = read_head(&mut stream).await;
  let status = String::from_utf8_lossy(&head)
    .lines()
    .next()
    .unwrap_or_default()
    .to_string();
  (stream, status)
}

fn client_config(roots: RootCertStore, alpn: &[&[u8]]) -> TlsConnector {
  let mut config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  TlsConnector::from(Arc::new(config))
}

fn ca_roots(ca_pem: &str) -> RootCertStore {
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  roots
}

/// TLS client trusting exactly `ca_pem`
pub async fn tls_client(stream: TcpStream, ca_pem: &str, alpn: &[&[u8]]) -> TlsStream<TcpStream> {
  try_tls_client(stream, ca_pem, alpn).await.unwrap()
}

/// [`tls_client`] that hands back a failed handshake instead of panicking
pub async fn try_tls_client(
  stream: TcpStream,
  ca_pem: &str,
  alpn: &[&[u8]],
) -> std::io::Result<TlsStream<TcpStream>> {
  client_config(ca_roots(ca_pem), alpn)
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
}

/// TLS client trusting exactly the origin certificate `cert`
pub async fn tls_client_for_origin(
  stream: TcpStream,
  cert: CertificateDer<'static>,
  alpn: &[&[u8]],
) -> TlsStream<TcpStream> {
  let mut roots = RootCertStore::empty();
  roots.add(cert).unwrap();
  client_config(roots, alpn)
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
    .unwrap()
}

/// GET `https://localhost/` over an HTTP/2 connection, returning the body
pub async fn h2_get<S>(stream: S) -> Vec<u8>
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
  let (sender, connection) = h2::client::handshake(stream).await.unwrap();
  tokio::spawn(connection);
  let mut sender = sender.ready().await.unwrap();
  let request = http::Request::get("https://localhost/").body(()).unwrap();
  let (response, _) = sender.send_request(request, true).unwrap();
  let response = response.await.unwrap();
  assert_eq!(response.status(), http::StatusCode::OK);
  let mut body = response.into_body();
  let mut collected = Vec::new();
  while let Some(chunk) = body.data().await {
    let chunk = chunk.unwrap();
    let _ = body.flow_control().release_capacity(chunk.len());
    collected.extend_from_slice(&chunk);
  }
  collected
}

/// UDP origin echoing every datagram back to its sender, counting them
pub async fn udp_echo_origin() -> (SocketAddr, Arc<AtomicUsize>) {
  let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  let addr = socket.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let counted = hits.clone();
  tokio::spawn(async move {
    let mut buf = vec![0u8; 65535];
    while let Ok((n, from)) = socket.recv_from(&mut buf).await {
      counted.fetch_add(1, Ordering::SeqCst);
      if socket.send_to(&buf[..n], from).await.is_err() {
        break;
      }
    }
  });
  (addr, hits)
}

/// Negotiate no-auth SOCKS5 and request UDP ASSOCIATE, returning the control
/// connection and the relay address from the reply
pub async fn socks5_udp_associate(proxy: SocketAddr) -> (TcpStream, SocketAddr) {
  let mut control = TcpStream::connect(proxy).await.unwrap();
  control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut choice = [0u8; 2];
  control.read_exact(&mut choice).await.unwrap();
  assert_eq!(choice, [0x05, 0x00]);

  control
    .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
    .await
    .unwrap();
  let mut reply = [0u8; 10];
  control.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
  let ip = Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
  let port = u16::from_be_bytes([reply[8], reply[9]]);
  (control, SocketAddr::new(IpAddr::V4(ip), port))
}

/// SOCKS5 UDP request header for an IPv4 `target`, followed by `payload`
pub fn udp_datagram(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
  let SocketAddr::V4(v4) = target else {
    panic!("IPv4 target expected");
  };
  let mut packet = vec![0x00, 0x00, 0x00, 0x01];
  packet.extend_from_slice(&v4.ip().octets());
  packet.extend_from_slice(&v4.port().to_be_bytes());
  packet.extend_from_slice(payload);
  packet
}
