//! HTTP proxy front end: absolute-form requests and `CONNECT`

use crate::bridge;
use crate::conn::{ProxyConn, Scheme};
use crate::error::{Error, Result};
use crate::http1::version_str;
use crate::server::Shared;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::Method;
use std::sync::Arc;

/// Serve one HTTP proxy session on the client leg
pub(crate) async fn serve(shared: &Arc<Shared>, mut client: ProxyConn) -> Result<()> {
  let hook = shared.handler.connect_interceptor();
  let request = match client.read_request(hook).await {
    Ok(Some(request)) => request,
    Ok(None) => return Ok(()),
    Err(e) => {
      client.close();
      return Err(e);
    }
  };
  let proto = version_str(request.version());
  let host = client.option().host().unwrap_or_default().to_string();
  let port = client
    .option()
    .port()
    .unwrap_or_else(|| Scheme::Http.default_port());

  if shared.is_loop(&host, port) {
    client.close();
    return Err(Error::protocol(format!(
      "refusing to proxy to the listener itself at {}:{}",
      host, port
    )));
  }

  let peer_ip = client.peer_addr().map(|a| a.ip());
  if !shared
    .access
    .check_header(peer_ip, request.headers().get(PROXY_AUTHORIZATION))
  {
    let rejection = format!(
      "{} 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n",
      proto
    );
    let _ = client.write_all(rejection.as_bytes()).await;
    client.close();
    return Err(Error::auth(format!(
      "missing or wrong proxy credentials from {:?}",
      client.peer_addr()
    )));
  }
  if let Err(e) = shared.handler.verify(client.peer_addr(), &request).await {
    client.close();
    return Err(e);
  }

  if client.option().scheme() == Some(Scheme::Https) {
    client.option_mut().fingerprint = shared.select_fingerprint(&request).await;
  }

  let host_header = request
    .headers()
    .get(HOST)
    .and_then(|h| h.to_str().ok())
    .unwrap_or(&host)
    .to_string();
  tracing::debug!(
    peer = ?client.peer_addr(),
    method = %request.method(),
    target = ?client.option().target(),
    "HTTP proxy request"
  );
  let server = match shared.connect_upstream(&client, &host_header).await {
    Ok(server) => server,
    Err(e) => {
      client.close();
      return Err(e);
    }
  };

  if request.method() == Method::CONNECT {
    let established = format!("{} 200 Connection established\r\n\r\n", proto);
    client.write_all(established.as_bytes()).await?;
  } else {
    client.queue(request);
  }
  bridge::copy_main(shared, client, server).await
}
