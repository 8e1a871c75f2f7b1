//! Traffic interception and modification interfaces

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintSpec;
use bytes::Bytes;
use http::{Method, Request, Response, Uri};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Intercepted request with connection metadata
pub struct MitmRequest {
  /// Source address and port (client)
  pub source: Option<SocketAddr>,
  /// Destination address (host:port)
  pub destination: String,
  /// Timestamp when the request was intercepted
  pub timestamp: u64,
  /// The buffered request, URI in absolute form
  pub request: Request<Bytes>,
}

impl MitmRequest {
  pub fn new(
    source: Option<SocketAddr>,
    destination: impl Into<String>,
    request: Request<Bytes>,
  ) -> Self {
    Self {
      source,
      destination: destination.into(),
      timestamp: now_millis(),
      request,
    }
  }

  pub fn request(&self) -> &Request<Bytes> {
    &self.request
  }

  pub fn request_mut(&mut self) -> &mut Request<Bytes> {
    &mut self.request
  }

  pub fn into_request(self) -> Request<Bytes> {
    self.request
  }

  /// Replace the body
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    *self.request.body_mut() = body.into();
  }
}

impl fmt::Debug for MitmRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MitmRequest")
      .field("source", &self.source)
      .field("destination", &self.destination)
      .field("timestamp", &self.timestamp)
      .field("method", self.request.method())
      .field("uri", self.request.uri())
      .finish()
  }
}

/// Intercepted response with connection metadata
pub struct MitmResponse {
  /// Where the response came from (host:port)
  pub source: String,
  /// Destination address and port (client)
  pub destination: Option<SocketAddr>,
  /// Timestamp when the response was intercepted
  pub timestamp: u64,
  /// Method of the request this answers
  pub method: Method,
  /// URI of the request this answers
  pub uri: Uri,
  /// The buffered response
  pub response: Response<Bytes>,
}

impl MitmResponse {
  pub fn new(
    source: impl Into<String>,
    destination: Option<SocketAddr>,
    method: Method,
    uri: Uri,
    response: Response<Bytes>,
  ) -> Self {
    Self {
      source: source.into(),
      destination,
      timestamp: now_millis(),
      method,
      uri,
      response,
    }
  }

  pub fn response(&self) -> &Response<Bytes> {
    &self.response
  }

  pub fn response_mut(&mut self) -> &mut Response<Bytes> {
    &mut self.response
  }

  pub fn into_response(self) -> Response<Bytes> {
    self.response
  }

  /// Replace the body
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    *self.response.body_mut() = body.into();
  }
}

impl fmt::Debug for MitmResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MitmResponse")
      .field("source", &self.source)
      .field("destination", &self.destination)
      .field("timestamp", &self.timestamp)
      .field("uri", &self.uri)
      .field("status", &self.response.status())
      .finish()
  }
}

/// Direction of a WebSocket message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsDirection {
  /// Client to server
  Send,
  /// Server to client
  Recv,
}

/// WebSocket message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
  Text,
  Binary,
  Ping,
  Pong,
  Close,
}

/// One WebSocket message passing through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
  pub direction: WsDirection,
  pub kind: FrameKind,
  /// Message payload. For `Close` this is the status code followed by the reason.
  pub payload: Bytes,
}

impl WsFrame {
  pub fn text(direction: WsDirection, text: impl Into<String>) -> Self {
    Self {
      direction,
      kind: FrameKind::Text,
      payload: Bytes::from(text.into()),
    }
  }

  /// Payload as UTF-8 when it is valid text
  pub fn as_text(&self) -> Option<&str> {
    std::str::from_utf8(&self.payload).ok()
  }
}

/// Trait for intercepting and modifying requests
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Intercept and optionally modify a request
  ///
  /// Return `None` to block the request, or return a modified request
  async fn intercept_request(&self, request: MitmRequest) -> Result<Option<MitmRequest>>;
}

/// Trait for intercepting and modifying responses
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Intercept and optionally modify a response
  ///
  /// Return `None` to block the response, or return a modified response
  async fn intercept_response(&self, response: MitmResponse) -> Result<Option<MitmResponse>>;
}

/// Trait for observing and rewriting WebSocket messages
#[async_trait::async_trait]
pub trait FrameInterceptor: Send + Sync {
  /// Return `None` to drop the message, `Err` to end the session
  async fn intercept_frame(&self, frame: WsFrame) -> Result<Option<WsFrame>>;
}

/// Hook over the proxy-facing request, run right after it is parsed
#[async_trait::async_trait]
pub trait ConnectInterceptor: Send + Sync {
  /// Inspect or rewrite the request. `Err` closes the connection.
  async fn on_request(&self, request: &mut Request<Bytes>) -> Result<()>;
}

/// Extra authentication over the proxy-facing request
#[async_trait::async_trait]
pub trait AuthVerifier: Send + Sync {
  /// `Err` rejects the connection
  async fn verify(&self, source: Option<SocketAddr>, request: &Request<Bytes>) -> Result<()>;
}

/// Per-request choice of upstream impersonation profile
#[async_trait::async_trait]
pub trait FingerprintSelector: Send + Sync {
  /// `None` falls back to the configured default
  async fn select(&self, request: &Request<Bytes>) -> Option<FingerprintSpec>;
}

/// Which hooks are present, computed once per session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
  /// Request or response hooks are registered
  pub http: bool,
  /// WebSocket message hooks are registered
  pub frames: bool,
}

impl Capabilities {
  pub fn any(&self) -> bool {
    self.http || self.frames
  }
}

/// All registered hooks. Immutable once the server is built.
#[derive(Default)]
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
  frame_interceptors: Vec<Arc<dyn FrameInterceptor>>,
  connect_interceptor: Option<Arc<dyn ConnectInterceptor>>,
  auth_verifier: Option<Arc<dyn AuthVerifier>>,
  fingerprint_selector: Option<Arc<dyn FingerprintSelector>>,
}

impl InterceptorHandler {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  pub fn add_frame_interceptor(&mut self, interceptor: Arc<dyn FrameInterceptor>) {
    self.frame_interceptors.push(interceptor);
  }

  pub fn set_connect_interceptor(&mut self, interceptor: Arc<dyn ConnectInterceptor>) {
    self.connect_interceptor = Some(interceptor);
  }

  pub fn set_auth_verifier(&mut self, verifier: Arc<dyn AuthVerifier>) {
    self.auth_verifier = Some(verifier);
  }

  pub fn set_fingerprint_selector(&mut self, selector: Arc<dyn FingerprintSelector>) {
    self.fingerprint_selector = Some(selector);
  }

  pub fn capabilities(&self) -> Capabilities {
    Capabilities {
      http: !self.request_interceptors.is_empty() || !self.response_interceptors.is_empty(),
      frames: !self.frame_interceptors.is_empty(),
    }
  }

  pub fn connect_interceptor(&self) -> Option<&dyn ConnectInterceptor> {
    self.connect_interceptor.as_deref()
  }

  pub async fn verify(&self, source: Option<SocketAddr>, request: &Request<Bytes>) -> Result<()> {
    match &self.auth_verifier {
      Some(verifier) => verifier.verify(source, request).await,
      None => Ok(()),
    }
  }

  pub async fn select_fingerprint(&self, request: &Request<Bytes>) -> Option<FingerprintSpec> {
    match &self.fingerprint_selector {
      Some(selector) => selector.select(request).await,
      None => None,
    }
  }

  /// Process a request through all interceptors
  pub async fn process_request(&self, mut request: MitmRequest) -> Result<Option<MitmRequest>> {
    for interceptor in &self.request_interceptors {
      match interceptor.intercept_request(request).await? {
        Some(modified) => request = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(request))
  }

  /// Process a response through all interceptors
  pub async fn process_response(&self, mut response: MitmResponse) -> Result<Option<MitmResponse>> {
    for interceptor in &self.response_interceptors {
      match interceptor.intercept_response(response).await? {
        Some(modified) => response = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(response))
  }

  /// Process a WebSocket message through all interceptors
  pub async fn process_frame(&self, mut frame: WsFrame) -> Result<Option<WsFrame>> {
    for interceptor in &self.frame_interceptors {
      match interceptor.intercept_frame(frame).await? {
        Some(modified) => frame = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(frame))
  }

  /// Run the request chain for a request that must be forwarded
  pub(crate) async fn forward_request(
    &self,
    source: Option<SocketAddr>,
    destination: &str,
    request: Request<Bytes>,
  ) -> Result<Request<Bytes>> {
    if self.request_interceptors.is_empty() {
      return Ok(request);
    }
    let uri = request.uri().clone();
    match self
      .process_request(MitmRequest::new(source, destination, request))
      .await?
    {
      Some(request) => Ok(request.into_request()),
      None => Err(Error::blocked(format!("request to {}", uri))),
    }
  }

  /// Run the response chain for a response that must be delivered
  pub(crate) async fn forward_response(
    &self,
    destination: Option<SocketAddr>,
    source: &str,
    method: &Method,
    uri: &Uri,
    response: Response<Bytes>,
  ) -> Result<Response<Bytes>> {
    if self.response_interceptors.is_empty() {
      return Ok(response);
    }
    let wrapped = MitmResponse::new(source, destination, method.clone(), uri.clone(), response);
    match self.process_response(wrapped).await? {
      Some(response) => Ok(response.into_response()),
      None => Err(Error::blocked(format!("response from {}", uri))),
    }
  }
}

/// Interceptor that logs all traffic passing through
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn intercept_request(&self, request: MitmRequest) -> Result<Option<MitmRequest>> {
    tracing::info!(
      source = ?request.source,
      "[MITM] HTTP Request: {} {}",
      request.request().method(),
      request.request().uri()
    );
    for (name, value) in request.request().headers() {
      tracing::info!("  {}: {:?}", name, value);
    }
    Ok(Some(request))
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn intercept_response(&self, response: MitmResponse) -> Result<Option<MitmResponse>> {
    tracing::info!(
      source = %response.source,
      "[MITM] HTTP Response: {} for {}",
      response.response().status(),
      response.uri
    );
    Ok(Some(response))
  }
}

#[async_trait::async_trait]
impl FrameInterceptor for LoggingInterceptor {
  async fn intercept_frame(&self, frame: WsFrame) -> Result<Option<WsFrame>> {
    tracing::info!(
      "[MITM] WebSocket {:?} {:?}: {} bytes",
      frame.direction,
      frame.kind,
      frame.payload.len()
    );
    Ok(Some(frame))
  }
}
