//! Access policy: source allow-list and proxy credentials

use crate::config::ProxyConfig;
use base64::prelude::BASE64_STANDARD;
use base64::write::EncoderWriter;
use base64::Engine;
use http::HeaderValue;
use std::collections::HashSet;
use std::io::Write;
use std::net::IpAddr;

/// Build a `Basic` credentials header value
pub fn encode_basic_auth(username: &str, password: &str) -> HeaderValue {
  let mut buf = b"Basic ".to_vec();
  {
    let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
    let _ = write!(encoder, "{}:{}", username, password);
  }
  let mut header = match HeaderValue::from_bytes(&buf) {
    Ok(value) => value,
    Err(_) => HeaderValue::from_static("Basic"),
  };
  header.set_sensitive(true);
  header
}

/// Decode a `Basic` credentials header into user and password
pub fn decode_basic_auth(value: &HeaderValue) -> Option<(String, String)> {
  let text = value.to_str().ok()?.trim();
  let (scheme, encoded) = text.split_once(' ')?;
  if !scheme.eq_ignore_ascii_case("basic") {
    return None;
  }
  let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
  let decoded = String::from_utf8(decoded).ok()?;
  let (user, pass) = decoded.split_once(':')?;
  Some((user.to_string(), pass.to_string()))
}

/// Who may use the proxy
#[derive(Debug, Clone, Default)]
pub struct Access {
  credentials: Option<(String, String)>,
  allow_list: HashSet<IpAddr>,
  disabled: bool,
}

impl Access {
  pub fn from_config(config: &ProxyConfig) -> Self {
    let credentials = match (&config.username, &config.password) {
      (Some(user), Some(pass)) if !user.is_empty() => Some((user.clone(), pass.clone())),
      _ => None,
    };
    Self {
      credentials,
      allow_list: config.allow_list.iter().copied().collect(),
      disabled: config.disable_verify,
    }
  }

  /// Credentials must be presented by sources that are not allow-listed
  pub fn requires_credentials(&self) -> bool {
    !self.disabled && self.credentials.is_some()
  }

  pub fn is_allow_listed(&self, ip: Option<IpAddr>) -> bool {
    self.disabled || ip.is_some_and(|ip| self.allow_list.contains(&ip))
  }

  /// Gate applied before any bytes are read.
  ///
  /// With credentials configured every source may try to authenticate.
  /// Without them, a non-empty allow-list is the only admission rule.
  pub fn admits(&self, ip: Option<IpAddr>) -> bool {
    if self.disabled || self.credentials.is_some() || self.allow_list.is_empty() {
      return true;
    }
    self.is_allow_listed(ip)
  }

  /// Whether a source passes with the given `Proxy-Authorization` value
  pub fn check_header(&self, ip: Option<IpAddr>, header: Option<&HeaderValue>) -> bool {
    if !self.requires_credentials() || self.is_allow_listed(ip) {
      return true;
    }
    header
      .and_then(decode_basic_auth)
      .is_some_and(|(user, pass)| self.check_credentials(user.as_bytes(), pass.as_bytes()))
  }

  /// Compare a username/password pair against the configured credentials
  pub fn check_credentials(&self, user: &[u8], pass: &[u8]) -> bool {
    match &self.credentials {
      Some((u, p)) => u.as_bytes() == user && p.as_bytes() == pass,
      None => true,
    }
  }
}
