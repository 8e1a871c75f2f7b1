//! Intercepting proxy with custom traffic modification
//!
//! Listens on 127.0.0.1:8080, stores its CA under `.mitm-relay-ca` and logs
//! every exchange. Trust the printed CA certificate in the client, then point
//! it at the proxy.
//!
//! To run:
//! ```bash
//! RUST_LOG=mitm_relay=debug cargo run --example simple_proxy
//! ```

use async_trait::async_trait;
use http::HeaderValue;
use mitm_relay::{
  CertSource, FrameInterceptor, LoggingInterceptor, MitmResponse, ProxyConfig, ProxyServer,
  ResponseInterceptor, Result, WsFrame,
};
use std::sync::Arc;

/// Tags every response that went through the proxy
struct ResponseTagger;

#[async_trait]
impl ResponseInterceptor for ResponseTagger {
  async fn intercept_response(&self, mut response: MitmResponse) -> Result<Option<MitmResponse>> {
    response
      .response_mut()
      .headers_mut()
      .insert("x-mitm-relay", HeaderValue::from_static("intercepted"));
    Ok(Some(response))
  }
}

/// Prints text WebSocket messages
struct FramePrinter;

#[async_trait]
impl FrameInterceptor for FramePrinter {
  async fn intercept_frame(&self, frame: WsFrame) -> Result<Option<WsFrame>> {
    if let Some(text) = frame.as_text() {
      println!("[WS {:?}] {}", frame.direction, text);
    }
    Ok(Some(frame))
  }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let mut config = ProxyConfig::bind("127.0.0.1:8080");
  config.certificates = CertSource::Storage(".mitm-relay-ca".into());

  let server = ProxyServer::builder()
    .config(config)
    .request_interceptor(Arc::new(LoggingInterceptor))
    .response_interceptor(Arc::new(LoggingInterceptor))
    .response_interceptor(Arc::new(ResponseTagger))
    .frame_interceptor(Arc::new(FramePrinter))
    .build()
    .await?;

  println!("Proxy listening on {}", server.addr());
  if let Some(pem) = server.ca_cert_pem() {
    println!("Trust this CA certificate in your client:\n{}", pem);
  }

  let shutdown = server.shutdown_token();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      shutdown.cancel();
    }
  });
  server.run().await?;
  Ok(())
}
