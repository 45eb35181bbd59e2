/*
 * Copyright (c) 2024-2025 Elide Technologies, Inc.
 *
 * Licensed under the MIT license (the "License"); you may not use this file except in compliance
 * with the License. You may obtain a copy of the License at
 *
 *   https://opensource.org/license/mit/
 *
 * Unless required by applicable law or agreed to in writing, software distributed under the License is distributed on
 * an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
 * License for the specific language governing permissions and limitations under the License.
 */

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use thiserror::Error;

/// A parsed service peer address.
///
/// The grammar accepts exactly three forms, schemes case-insensitive:
///
/// - `connect://A.B.C.D:PORT`: this side initiates traffic toward the address
/// - `listen://A.B.C.D:PORT`: this side binds the address and waits
/// - `serial:<devname>:BAUD`: a serial device under `/dev`, opened exclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUri {
  Connect(SocketAddrV4),
  Listen(SocketAddrV4),
  Serial { dev: String, baud: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported peer address: {0}")]
pub struct PeerUriError(pub String);

impl PeerUri {
  pub fn is_connect(&self) -> bool {
    matches!(self, PeerUri::Connect(_))
  }

  pub fn is_listen(&self) -> bool {
    matches!(self, PeerUri::Listen(_))
  }

  pub fn is_serial(&self) -> bool {
    matches!(self, PeerUri::Serial { .. })
  }
}

fn parse_host_port(rest: &str) -> Option<SocketAddrV4> {
  let (host, port) = rest.rsplit_once(':')?;
  if host.is_empty() || !host.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
    return None;
  }
  let addr = Ipv4Addr::from_str(host).ok()?;
  if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  let port = u16::from_str(port).ok()?;
  Some(SocketAddrV4::new(addr, port))
}

fn strip_scheme<'a>(uri: &'a str, scheme: &str) -> Option<&'a str> {
  if uri.len() >= scheme.len() && uri.as_bytes()[..scheme.len()].eq_ignore_ascii_case(scheme.as_bytes()) {
    uri.get(scheme.len()..)
  } else {
    None
  }
}

fn valid_dev_name(dev: &str) -> bool {
  !dev.is_empty()
    && dev
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'/')
}

impl FromStr for PeerUri {
  type Err = PeerUriError;

  fn from_str(uri: &str) -> Result<PeerUri, PeerUriError> {
    let err = || PeerUriError(uri.to_string());

    if let Some(rest) = strip_scheme(uri, "connect://") {
      return parse_host_port(rest).map(PeerUri::Connect).ok_or_else(err);
    }
    if let Some(rest) = strip_scheme(uri, "listen://") {
      return parse_host_port(rest).map(PeerUri::Listen).ok_or_else(err);
    }
    if let Some(rest) = strip_scheme(uri, "serial:") {
      let (dev, baud) = rest.rsplit_once(':').ok_or_else(err)?;
      if !valid_dev_name(dev) || baud.is_empty() || !baud.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
      }
      let baud = u32::from_str(baud).map_err(|_| err())?;
      return Ok(PeerUri::Serial { dev: dev.to_string(), baud });
    }
    Err(err())
  }
}

impl fmt::Display for PeerUri {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PeerUri::Connect(addr) => write!(f, "connect://{addr}"),
      PeerUri::Listen(addr) => write!(f, "listen://{addr}"),
      PeerUri::Serial { dev, baud } => write!(f, "serial:{dev}:{baud}"),
    }
  }
}
