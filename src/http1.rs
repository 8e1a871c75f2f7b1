//! HTTP/1.x message reading and serialization
//!
//! Messages are parsed with `httparse` and fully buffered into
//! `http::Request<Bytes>` / `http::Response<Bytes>`. When a message is written
//! back out its framing is recomputed, so a chunked body that was de-chunked on
//! read leaves with a `Content-Length`.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a request or status line plus headers
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for the number of header fields
const MAX_HEADERS: usize = 128;
/// Upper bound for a chunk-size line
const MAX_CHUNK_LINE: usize = 4 * 1024;
/// Upper bound for a buffered message body
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Headers that only make sense between the client and this proxy
const PROXY_ONLY_HEADERS: [&str; 2] = ["proxy-authorization", "proxy-connection"];

/// How a response body is framed when written to an HTTP/1.1 peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// Headers are written untouched and the body verbatim
  Preserve,
  /// `Content-Length` is set to the buffered body length
  Length,
  /// `Transfer-Encoding: chunked` with the body as a single chunk
  Chunked,
}

impl Framing {
  /// Framing for a response relayed between two HTTP/1.1 legs
  pub fn relay(method: &Method, response: &Response<Bytes>) -> Self {
    if is_bodiless(method, response.status()) {
      Framing::Preserve
    } else {
      Framing::Length
    }
  }

  /// Framing for a response re-originated from an HTTP/2 upstream
  pub fn bridged(method: &Method, response: &Response<Bytes>) -> Self {
    if is_bodiless(method, response.status()) {
      Framing::Preserve
    } else if response.headers().contains_key(CONTENT_LENGTH) {
      Framing::Length
    } else {
      Framing::Chunked
    }
  }
}

/// Whether a response to `method` with `status` never carries a body
pub fn is_bodiless(method: &Method, status: StatusCode) -> bool {
  method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
    || (method == Method::CONNECT && status.is_success())
}

/// `read_until(b'\n')` that buffers at most `limit` bytes
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let n = (&mut *reader).take(limit as u64).read_until(b'\n', buf).await?;
  Ok(n)
}

/// Read a message head up to and including the empty line.
///
/// Returns `None` when the peer closed cleanly before sending anything.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = Vec::with_capacity(1024);
  loop {
    let start = head.len();
    let n = read_line(reader, &mut head, MAX_HEAD_SIZE + 1 - start).await?;
    if n == 0 {
      if head.is_empty() {
        return Ok(None);
      }
      return Err(Error::protocol("connection closed inside message head"));
    }
    if head.len() > MAX_HEAD_SIZE {
      return Err(Error::protocol("message head exceeds maximum size"));
    }
    let blank = matches!(&head[start..], b"\r\n" | b"\n");
    if blank {
      // stray CRLF between pipelined messages
      if start == 0 {
        head.clear();
        continue;
      }
      return Ok(Some(head));
    }
  }
}

fn version_of(minor: Option<u8>) -> Version {
  match minor {
    Some(0) => Version::HTTP_10,
    _ => Version::HTTP_11,
  }
}

/// Status-line / request-line token for an HTTP/1.x version
pub fn version_str(version: Version) -> &'static str {
  if version == Version::HTTP_10 {
    "HTTP/1.0"
  } else {
    "HTTP/1.1"
  }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
  let mut map = HeaderMap::with_capacity(raw.len());
  for header in raw {
    let name = HeaderName::from_bytes(header.name.as_bytes())
      .map_err(|_| Error::protocol(format!("invalid header name: {}", header.name)))?;
    let value = HeaderValue::from_bytes(header.value)
      .map_err(|_| Error::protocol(format!("invalid value for header {}", header.name)))?;
    map.append(name, value);
  }
  Ok(map)
}

/// Parse a complete request head
pub fn parse_request_head(head: &[u8]) -> Result<Request<()>> {
  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut parsed = httparse::Request::new(&mut headers);
  match parsed.parse(head) {
    Ok(httparse::Status::Complete(_)) => {}
    Ok(httparse::Status::Partial) => return Err(Error::protocol("incomplete request head")),
    Err(e) => return Err(Error::protocol(format!("malformed request: {}", e))),
  }
  let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
    .map_err(|_| Error::protocol("invalid request method"))?;
  let target = parsed.path.unwrap_or_default();
  let uri: Uri = target
    .parse()
    .map_err(|e| Error::protocol(format!("invalid request target {}: {}", target, e)))?;
  let mut request = Request::new(());
  *request.method_mut() = method;
  *request.uri_mut() = uri;
  *request.version_mut() = version_of(parsed.version);
  *request.headers_mut() = collect_headers(parsed.headers)?;
  Ok(request)
}

/// Parse a complete response head
pub fn parse_response_head(head: &[u8]) -> Result<Response<()>> {
  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut parsed = httparse::Response::new(&mut headers);
  match parsed.parse(head) {
    Ok(httparse::Status::Complete(_)) => {}
    Ok(httparse::Status::Partial) => return Err(Error::protocol("incomplete response head")),
    Err(e) => return Err(Error::protocol(format!("malformed response: {}", e))),
  }
  let status = StatusCode::from_u16(parsed.code.unwrap_or_default())
    .map_err(|_| Error::protocol("invalid status code"))?;
  let mut response = Response::new(());
  *response.status_mut() = status;
  *response.version_mut() = version_of(parsed.version);
  *response.headers_mut() = collect_headers(parsed.headers)?;
  Ok(response)
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
  match headers.get(CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<usize>().ok())
      .map(Some)
      .ok_or_else(|| Error::protocol("invalid content-length")),
  }
}

async fn read_chunked<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = BytesMut::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line(reader, &mut line, MAX_CHUNK_LINE).await? == 0 {
      return Err(Error::protocol("connection closed inside chunked body"));
    }
    if !line.ends_with(b"\n") {
      return Err(Error::protocol("invalid chunk header"));
    }
    let text = std::str::from_utf8(&line).map_err(|_| Error::protocol("invalid chunk header"))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    let size =
      usize::from_str_radix(size, 16).map_err(|_| Error::protocol("invalid chunk size"))?;
    if size == 0 {
      // trailers are read and discarded
      let mut trailers = 0;
      loop {
        line.clear();
        let n = read_line(reader, &mut line, MAX_HEAD_SIZE + 1 - trailers).await?;
        trailers += n;
        if trailers > MAX_HEAD_SIZE {
          return Err(Error::protocol("chunked trailers exceed maximum size"));
        }
        if n == 0 || line == b"\r\n" || line == b"\n" {
          break;
        }
      }
      return Ok(body.freeze());
    }
    let start = body.len();
    let end = start
      .checked_add(size)
      .filter(|end| *end <= MAX_BODY_SIZE)
      .ok_or_else(|| Error::protocol("chunked body exceeds maximum size"))?;
    body.resize(end, 0);
    reader.read_exact(&mut body[start..]).await?;
    line.clear();
    read_line(reader, &mut line, MAX_CHUNK_LINE).await?;
  }
}

async fn read_body<R>(reader: &mut R, headers: &HeaderMap, until_eof: bool) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if is_chunked(headers) {
    return read_chunked(reader).await;
  }
  if let Some(len) = content_length(headers)? {
    if len > MAX_BODY_SIZE {
      return Err(Error::protocol("body exceeds maximum size"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    return Ok(Bytes::from(body));
  }
  if until_eof {
    let mut body = Vec::new();
    let mut limited = (&mut *reader).take(MAX_BODY_SIZE as u64 + 1);
    limited.read_to_end(&mut body).await?;
    if body.len() > MAX_BODY_SIZE {
      return Err(Error::protocol("body exceeds maximum size"));
    }
    return Ok(Bytes::from(body));
  }
  Ok(Bytes::new())
}

/// Read one request, head and body.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request<Bytes>>>
where
  R: AsyncBufRead + Unpin,
{
  let Some(head) = read_head(reader).await? else {
    return Ok(None);
  };
  let request = parse_request_head(&head)?;
  let body = if request.method() == Method::CONNECT {
    Bytes::new()
  } else {
    read_body(reader, request.headers(), false).await?
  };
  Ok(Some(request.map(|()| body)))
}

/// Read one final response to a request made with `method`.
///
/// Interim `1xx` responses other than `101 Switching Protocols` are skipped.
pub async fn read_response<R>(reader: &mut R, method: &Method) -> Result<Response<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let head = read_head(reader).await?.ok_or(Error::Closed)?;
    let response = parse_response_head(&head)?;
    let status = response.status();
    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }
    let body = if is_bodiless(method, status) {
      Bytes::new()
    } else {
      read_body(reader, response.headers(), true).await?
    };
    return Ok(response.map(|()| body));
  }
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap, skip: impl Fn(&HeaderName) -> bool) {
  for (name, value) in headers {
    if skip(name) {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
}

/// Request-target for a request sent to an origin server
fn request_target(request: &Request<Bytes>) -> String {
  let uri = request.uri();
  if request.method() == Method::CONNECT {
    return uri
      .authority()
      .map(|a| a.to_string())
      .unwrap_or_else(|| uri.to_string());
  }
  uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .filter(|pq| !pq.is_empty())
    .unwrap_or_else(|| "/".to_string())
}

/// Serialize a request in origin-form for an upstream HTTP/1.1 server.
pub fn encode_request(request: &Request<Bytes>) -> Vec<u8> {
  let body = request.body();
  let mut buf = Vec::with_capacity(256 + body.len());
  buf.extend_from_slice(request.method().as_str().as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(request_target(request).as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(version_str(request.version()).as_bytes());
  buf.extend_from_slice(b"\r\n");
  let headers = request.headers();
  let framed = headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING);
  write_headers(&mut buf, headers, |name| {
    name == CONTENT_LENGTH
      || name == TRANSFER_ENCODING
      || PROXY_ONLY_HEADERS.contains(&name.as_str())
  });
  if framed || !body.is_empty() {
    buf.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
  }
  buf.extend_from_slice(b"\r\n");
  buf.extend_from_slice(body);
  buf
}

/// Serialize a response for an HTTP/1.x client.
pub fn encode_response(response: &Response<Bytes>, framing: Framing) -> Vec<u8> {
  let body = response.body();
  let status = response.status();
  let mut buf = Vec::with_capacity(256 + body.len());
  buf.extend_from_slice(version_str(response.version()).as_bytes());
  buf.extend_from_slice(
    format!(
      " {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  match framing {
    Framing::Preserve => {
      write_headers(&mut buf, response.headers(), |_| false);
      buf.extend_from_slice(b"\r\n");
      buf.extend_from_slice(body);
    }
    Framing::Length => {
      write_headers(&mut buf, response.headers(), |name| {
        name == CONTENT_LENGTH || name == TRANSFER_ENCODING
      });
      buf.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
      buf.extend_from_slice(body);
    }
    Framing::Chunked => {
      write_headers(&mut buf, response.headers(), |name| {
        name == CONTENT_LENGTH || name == TRANSFER_ENCODING
      });
      buf.extend_from_slice(b"transfer-encoding: chunked\r\n\r\n");
      if !body.is_empty() {
        buf.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(b"\r\n");
      }
      buf.extend_from_slice(b"0\r\n\r\n");
    }
  }
  buf
}
