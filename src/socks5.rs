//! SOCKS5 front end: method negotiation, CONNECT and UDP ASSOCIATE

use crate::bridge;
use crate::classify::TLS_HANDSHAKE;
use crate::conn::{join_host_port, ProxyConn, Scheme};
use crate::error::{Error, Result};
use crate::server::Shared;
use bytes::Bytes;
use http::{Method, Request};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTHENTICATION: u8 = 0x00;
const SOCKS5_USERNAME_PASSWORD: u8 = 0x02;
const SOCKS5_NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const SOCKS5_AUTH_VERSION: u8 = 0x01;
const SOCKS5_AUTH_SUCCESS: u8 = 0x00;
const SOCKS5_AUTH_FAILURE: u8 = 0xFF;

const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS5_REP_SUCCESS: u8 = 0x00;
const SOCKS5_REP_NOT_ALLOWED: u8 = 0x02;
const SOCKS5_REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const SOCKS5_REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Largest UDP payload relayed in one datagram
const MAX_DATAGRAM: usize = 65535;

/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 or IPv6 address
  Ip(SocketAddr),
  /// Domain name
  Domain(String, u16),
}

impl TargetAddr {
  /// Get host and port as string
  pub fn to_host_port(&self) -> String {
    join_host_port(&self.host(), self.port())
  }

  /// Get host (without port or brackets)
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ip(addr) => addr.ip().to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }

  /// Get port
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(addr) => addr.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }

  /// Append `ATYP | ADDR | PORT` to `packet`
  pub(crate) fn encode(&self, packet: &mut Vec<u8>) -> Result<()> {
    match self {
      TargetAddr::Ip(SocketAddr::V4(addr)) => {
        packet.push(SOCKS5_ATYP_IPV4);
        packet.extend_from_slice(&addr.ip().octets());
      }
      TargetAddr::Ip(SocketAddr::V6(addr)) => {
        packet.push(SOCKS5_ATYP_IPV6);
        packet.extend_from_slice(&addr.ip().octets());
      }
      TargetAddr::Domain(domain, _) => {
        let len = u8::try_from(domain.len())
          .map_err(|_| Error::protocol(format!("domain too long for SOCKS5: {}", domain)))?;
        packet.push(SOCKS5_ATYP_DOMAIN);
        packet.push(len);
        packet.extend_from_slice(domain.as_bytes());
      }
    }
    packet.extend_from_slice(&self.port().to_be_bytes());
    Ok(())
  }

  /// Parse `ATYP | ADDR | PORT` from the front of a datagram, returning the
  /// address and the bytes consumed. `None` for an unknown address type.
  fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
    let short = || Error::protocol("truncated SOCKS5 address");
    let atyp = *buf.first().ok_or_else(short)?;
    let (addr_len, start) = match atyp {
      SOCKS5_ATYP_IPV4 => (4, 1),
      SOCKS5_ATYP_IPV6 => (16, 1),
      SOCKS5_ATYP_DOMAIN => (*buf.get(1).ok_or_else(short)? as usize, 2),
      _ => return Ok(None),
    };
    let end = start + addr_len;
    let port_bytes = buf.get(end..end + 2).ok_or_else(short)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    let raw = &buf[start..end];
    let addr = match atyp {
      SOCKS5_ATYP_IPV4 => {
        let octets: [u8; 4] = raw.try_into().map_err(|_| short())?;
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
      }
      SOCKS5_ATYP_IPV6 => {
        let octets: [u8; 16] = raw.try_into().map_err(|_| short())?;
        TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
      }
      _ => {
        let domain = String::from_utf8(raw.to_vec())
          .map_err(|_| Error::protocol("Invalid domain name"))?;
        TargetAddr::Domain(domain, port)
      }
    };
    Ok(Some((addr, end + 2)))
  }
}

/// Serve one SOCKS5 session on the client leg
pub(crate) async fn serve(shared: &Arc<Shared>, mut client: ProxyConn) -> Result<()> {
  negotiate(shared, &mut client).await?;

  let mut head = [0u8; 4];
  client.read_exact(&mut head).await?;
  let [version, command, _reserved, atyp] = head;
  if version != SOCKS5_VERSION {
    client.close();
    return Err(Error::protocol(format!(
      "Invalid SOCKS version in request: {}",
      version
    )));
  }
  if command != SOCKS5_CMD_CONNECT && command != SOCKS5_CMD_UDP_ASSOCIATE {
    send_reply(&mut client, SOCKS5_REP_COMMAND_NOT_SUPPORTED, None).await?;
    client.close();
    return Err(Error::protocol(format!("Unsupported command: {}", command)));
  }
  let Some(target) = read_target(&mut client, atyp).await? else {
    send_reply(&mut client, SOCKS5_REP_ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
    client.close();
    return Err(Error::protocol(format!("Unsupported address type: {}", atyp)));
  };

  match command {
    SOCKS5_CMD_CONNECT => connect(shared, client, target).await,
    _ => udp_associate(client).await,
  }
}

/// Method selection, plus the username/password sub-negotiation when required
async fn negotiate(shared: &Shared, client: &mut ProxyConn) -> Result<()> {
  let version = client.read_u8().await?;
  if version != SOCKS5_VERSION {
    client.close();
    return Err(Error::protocol(format!(
      "Unsupported SOCKS version: {}",
      version
    )));
  }
  let nmethods = client.read_u8().await?;
  let mut methods = vec![0u8; nmethods as usize];
  client.read_exact(&mut methods).await?;

  let peer_ip = client.peer_addr().map(|a| a.ip());
  let access = &shared.access;
  if !access.requires_credentials() || access.is_allow_listed(peer_ip) {
    return client
      .write_all(&[SOCKS5_VERSION, SOCKS5_NO_AUTHENTICATION])
      .await;
  }
  if !methods.contains(&SOCKS5_USERNAME_PASSWORD) {
    client
      .write_all(&[SOCKS5_VERSION, SOCKS5_NO_ACCEPTABLE_METHODS])
      .await?;
    client.close();
    return Err(Error::auth("No acceptable authentication method"));
  }
  client
    .write_all(&[SOCKS5_VERSION, SOCKS5_USERNAME_PASSWORD])
    .await?;

  let auth_version = client.read_u8().await?;
  if auth_version != SOCKS5_AUTH_VERSION {
    client.close();
    return Err(Error::protocol(format!(
      "Unsupported auth version: {}",
      auth_version
    )));
  }
  let user_len = client.read_u8().await?;
  let mut user = vec![0u8; user_len as usize];
  client.read_exact(&mut user).await?;
  let pass_len = client.read_u8().await?;
  let mut pass = vec![0u8; pass_len as usize];
  client.read_exact(&mut pass).await?;

  if access.check_credentials(&user, &pass) {
    client
      .write_all(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS])
      .await
  } else {
    client
      .write_all(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE])
      .await?;
    client.close();
    Err(Error::auth(format!(
      "SOCKS5 credentials rejected for {:?}",
      client.peer_addr()
    )))
  }
}

async fn read_target(client: &mut ProxyConn, atyp: u8) -> Result<Option<TargetAddr>> {
  let target = match atyp {
    SOCKS5_ATYP_IPV4 => {
      let mut addr = [0u8; 4];
      client.read_exact(&mut addr).await?;
      let port = read_port(client).await?;
      TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
    }
    SOCKS5_ATYP_IPV6 => {
      let mut addr = [0u8; 16];
      client.read_exact(&mut addr).await?;
      let port = read_port(client).await?;
      TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
    }
    SOCKS5_ATYP_DOMAIN => {
      let len = client.read_u8().await?;
      let mut domain = vec![0u8; len as usize];
      client.read_exact(&mut domain).await?;
      let port = read_port(client).await?;
      let domain = String::from_utf8(domain).map_err(|_| {
        client.close();
        Error::protocol("Invalid domain name")
      })?;
      TargetAddr::Domain(domain, port)
    }
    _ => return Ok(None),
  };
  Ok(Some(target))
}

async fn read_port(client: &mut ProxyConn) -> Result<u16> {
  let mut port = [0u8; 2];
  client.read_exact(&mut port).await?;
  Ok(u16::from_be_bytes(port))
}

/// Reply format: `[VER, REP, RSV, ATYP, BND.ADDR, BND.PORT]`
async fn send_reply(client: &mut ProxyConn, reply: u8, bound: Option<SocketAddr>) -> Result<()> {
  let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
  let mut response = vec![SOCKS5_VERSION, reply, 0x00];
  TargetAddr::Ip(bound).encode(&mut response)?;
  client.write_all(&response).await
}

async fn connect(shared: &Arc<Shared>, mut client: ProxyConn, target: TargetAddr) -> Result<()> {
  let host = target.host();
  let port = target.port();
  if shared.is_loop(&host, port) {
    send_reply(&mut client, SOCKS5_REP_NOT_ALLOWED, None).await?;
    client.close();
    return Err(Error::protocol(format!(
      "refusing to connect to the proxy itself at {}",
      target.to_host_port()
    )));
  }
  send_reply(&mut client, SOCKS5_REP_SUCCESS, None).await?;

  let tls = client.peek_byte().await? == TLS_HANDSHAKE;
  {
    let option = client.option_mut();
    option.set_host(host);
    option.set_port(port);
    if tls {
      option.set_scheme(Scheme::Https);
      option.set_method(Method::CONNECT);
    } else {
      option.set_scheme(Scheme::Http);
    }
  }
  tracing::debug!(peer = ?client.peer_addr(), target = %target.to_host_port(), tls, "SOCKS5 CONNECT");

  if tls {
    let probe = Request::builder()
      .method(Method::CONNECT)
      .uri(target.to_host_port())
      .body(Bytes::new())?;
    client.option_mut().fingerprint = shared.select_fingerprint(&probe).await;
  }
  let server = shared
    .connect_upstream(&client, &target.to_host_port())
    .await?;
  bridge::copy_main(shared, client, server).await
}

/// Relay datagrams for the lifetime of the control connection
async fn udp_associate(mut client: ProxyConn) -> Result<()> {
  let local_ip = client
    .local_addr()
    .map(|a| a.ip())
    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
  let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
  let bound = socket.local_addr()?;
  send_reply(&mut client, SOCKS5_REP_SUCCESS, Some(bound)).await?;
  tracing::debug!(peer = ?client.peer_addr(), relay = %bound, "SOCKS5 UDP ASSOCIATE");

  let token = client.token().clone();
  let control = async {
    // any byte after the request is ignored; EOF or error ends the association
    let mut buf = [0u8; 64];
    while let Ok(n) = client.read(&mut buf).await {
      if n == 0 {
        break;
      }
    }
  };
  let result = tokio::select! {
    _ = control => Ok(()),
    res = relay_datagrams(&socket) => res,
  };
  token.cancel();
  result
}

/// One flow: the first client source talks to the first target
async fn relay_datagrams(socket: &UdpSocket) -> Result<()> {
  let mut client_addr: Option<SocketAddr> = None;
  let mut target: Option<SocketAddr> = None;
  let mut buf = vec![0u8; MAX_DATAGRAM];
  loop {
    let (n, from) = socket.recv_from(&mut buf).await?;
    let packet = &buf[..n];

    if target == Some(from) {
      if let Some(client_addr) = client_addr {
        let mut out = vec![0x00, 0x00, 0x00];
        TargetAddr::Ip(from).encode(&mut out)?;
        out.extend_from_slice(packet);
        socket.send_to(&out, client_addr).await?;
      }
      continue;
    }

    match client_addr {
      None => client_addr = Some(from),
      Some(pinned) if pinned != from => {
        tracing::trace!(%from, "dropping datagram from unknown source");
        continue;
      }
      Some(_) => {}
    }

    let Some((frag, dest, payload)) = parse_datagram(packet)? else {
      tracing::trace!(%from, "dropping malformed datagram");
      continue;
    };
    if frag != 0 {
      tracing::trace!(frag, "dropping fragmented datagram");
      continue;
    }
    match target {
      None => target = Some(dest),
      Some(pinned) if pinned != dest => {
        tracing::trace!(%dest, "dropping datagram for a second target");
        continue;
      }
      Some(_) => {}
    }
    socket.send_to(payload, dest).await?;
  }
}

/// `RSV(2) | FRAG | ATYP | DST.ADDR | DST.PORT | DATA`
///
/// `None` for a truncated datagram or an unknown address type. A domain
/// target is an error and ends the association.
fn parse_datagram(packet: &[u8]) -> Result<Option<(u8, SocketAddr, &[u8])>> {
  if packet.len() < 4 {
    return Ok(None);
  }
  if packet[3] == SOCKS5_ATYP_DOMAIN {
    return Err(Error::protocol("domain targets are not supported over UDP"));
  }
  let frag = packet[2];
  match TargetAddr::decode(&packet[3..]) {
    Ok(Some((TargetAddr::Ip(dest), used))) => Ok(Some((frag, dest, &packet[3 + used..]))),
    _ => Ok(None),
  }
}
