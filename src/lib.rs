//! Multi-protocol intercepting proxy
//!
//! One listening socket serves HTTP proxy requests, `CONNECT` tunnels,
//! TLS-wrapped proxy sessions and SOCKS5. Tunnelled TLS can be intercepted
//! with leaf certificates minted on the fly, and traffic is exposed to the
//! embedding application through request, response and WebSocket message
//! hooks.
//!
//! # Features
//!
//! - Protocol detection from the first byte (SOCKS5, TLS, HTTP)
//! - TLS interception that mirrors the client's ALPN offer upstream
//! - HTTP/1.1 and HTTP/2 negotiated independently on each leg, with bridging
//! - WebSocket relay with per-message hooks
//! - Upstream proxy chaining over HTTP, HTTPS and SOCKS5
//! - Pluggable dialer, TLS handshaker and certificate engine
//!
//! # Example
//!
//! ```no_run
//! use mitm_relay::{LoggingInterceptor, ProxyConfig, ProxyServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ProxyServer::builder()
//!         .config(ProxyConfig::bind("127.0.0.1:8080"))
//!         .request_interceptor(Arc::new(LoggingInterceptor))
//!         .build()
//!         .await?;
//!     println!("{}", server.ca_cert_pem().unwrap_or_default());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod auth;
mod bridge;
mod ca;
mod classify;
mod config;
mod conn;
mod dialer;
mod error;
mod fingerprint;
mod h2_bridge;
mod http1;
mod http_proxy;
mod interceptor;
mod mitm;
mod server;
mod socks5;
mod tls;
mod upstream;
mod websocket;

pub use auth::{decode_basic_auth, encode_basic_auth, Access};
pub use bridge::Strategy;
pub use ca::{CertificateAuthority, CertificateManager, LeafCert, LeafMinter};
pub use classify::Protocol;
pub use config::{CertSource, DialOptions, ProxyConfig, ServerIdentity, UpstreamProxy};
pub use conn::{
  AsyncStream, BoxStream, ConnMeta, ConnOption, ProxyConn, Scheme, Side, WsHandshake,
  DEFAULT_IDLE_TIMEOUT,
};
pub use dialer::{Dialer, TcpDialer};
pub use error::{Error, Result};
pub use fingerprint::{
  FingerprintSpec, H2Settings, Handshake, RustlsHandshaker, TlsHandshaker, ALPN_H2, ALPN_HTTP11,
};
pub use http1::Framing;
pub use interceptor::{
  AuthVerifier, Capabilities, ConnectInterceptor, FingerprintSelector, FrameInterceptor,
  FrameKind, InterceptorHandler, LoggingInterceptor, MitmRequest, MitmResponse,
  RequestInterceptor, ResponseInterceptor, WsDirection, WsFrame,
};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use socks5::TargetAddr;
pub use upstream::{ForwardProxy, ProxyResolver};
