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

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mav::AggBuf;
use crate::{PacketSender, PeerCell, PeerList, ProxyError, PROXY_BACKLOG};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Keep-alive cadence toward every NIC; keeps far-end NAT/flow state warm even when the
/// tunnel is idle.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(1);

/// Layer-3 tunnel proxy parameters.
pub struct TunOpts {
  pub ifname: String,
  /// CIDR address assigned to the device, e.g. `10.5.0.1/24`.
  pub ifaddr: String,
  pub mtu: usize,
  pub default_route: bool,
  pub agg_timeout: Duration,
}

fn create_tun(ifname: &str) -> Result<OwnedFd, ProxyError> {
  let fd = unsafe {
    libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC)
  };
  if fd < 0 {
    return Err(ProxyError::Tun(std::io::Error::last_os_error()));
  }
  let fd = unsafe { OwnedFd::from_raw_fd(fd) };

  let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
  let name = ifname.as_bytes();
  if name.len() >= libc::IFNAMSIZ {
    return Err(ProxyError::IfConfig(format!("interface name too long: {ifname}")));
  }
  for (slot, byte) in ifr.ifr_name.iter_mut().zip(name) {
    *slot = *byte as libc::c_char;
  }
  ifr.ifr_ifru.ifru_flags = IFF_TUN | IFF_NO_PI;

  if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) } < 0 {
    return Err(ProxyError::Tun(std::io::Error::last_os_error()));
  }
  info!(ifname, "tunnel device created");
  Ok(fd)
}

async fn ip_cmd(args: &[&str]) -> Result<(), ProxyError> {
  let output = tokio::process::Command::new("ip")
    .args(args)
    .output()
    .await
    .map_err(|err| ProxyError::IfConfig(format!("ip {}: {err}", args.join(" "))))?;
  if !output.status.success() {
    return Err(ProxyError::IfConfig(format!(
      "ip {}: {}",
      args.join(" "),
      String::from_utf8_lossy(&output.stderr).trim()
    )));
  }
  Ok(())
}

/// Layer-3 tunnel proxy.
///
/// Packets read from the device are aggregated with a 2-byte length prefix each, flushed by
/// the MTU or `agg_timeout`; aggregated packets from the air are split and written back to the
/// device. Keep-alives are broadcast through `all_peers` so they reach every NIC, not only the
/// selected one.
pub struct TunTapProxy {
  sender: PacketSender,
  peer: PeerCell,
  all_peers: PeerList,
  task: JoinHandle<()>,
}

impl TunTapProxy {
  pub async fn open(opts: TunOpts) -> Result<TunTapProxy, ProxyError> {
    let fd = create_tun(&opts.ifname)?;

    ip_cmd(&["addr", "add", &opts.ifaddr, "dev", &opts.ifname]).await?;
    ip_cmd(&["link", "set", &opts.ifname, "mtu", &opts.mtu.to_string(), "up"]).await?;
    if opts.default_route {
      ip_cmd(&["route", "add", "default", "dev", &opts.ifname]).await?;
    }

    let peer = PeerCell::new();
    let all_peers = PeerList::new();
    let (sender, inbox) = tokio::sync::mpsc::channel::<Bytes>(PROXY_BACKLOG);

    let task = tokio::spawn(run_tun(fd, opts, peer.clone(), all_peers.clone(), inbox));
    Ok(TunTapProxy { sender, peer, all_peers, task })
  }

  pub fn sender(&self) -> PacketSender {
    self.sender.clone()
  }

  pub fn peer(&self) -> PeerCell {
    self.peer.clone()
  }

  /// Peer list receiving keep-alive broadcasts.
  pub fn all_peers(&self) -> PeerList {
    self.all_peers.clone()
  }
}

impl Drop for TunTapProxy {
  fn drop(&mut self) {
    self.task.abort();
  }
}

/// Split an aggregated payload back into packets (2-byte big-endian length per packet).
fn split_packets(data: &[u8]) -> Vec<&[u8]> {
  let mut packets = Vec::new();
  let mut rest = data;
  while rest.len() >= 2 {
    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    if rest.len() < 2 + len {
      debug!("truncated tunnel aggregate, tail dropped");
      break;
    }
    packets.push(&rest[2..2 + len]);
    rest = &rest[2 + len..];
  }
  packets
}

async fn run_tun(
  fd: OwnedFd,
  opts: TunOpts,
  peer: PeerCell,
  all_peers: PeerList,
  mut inbox: tokio::sync::mpsc::Receiver<Bytes>,
) {
  let fd = match AsyncFd::new(fd) {
    Ok(fd) => fd,
    Err(err) => {
      debug!(%err, "tun fd registration failed");
      return;
    }
  };

  let mut agg = AggBuf::new(opts.mtu, opts.agg_timeout);
  let mut keepalive = tokio::time::interval(KEEPALIVE_PERIOD);
  let mut buf = vec![0u8; opts.mtu + 64];

  loop {
    let deadline = agg.deadline();
    tokio::select! {
      guard = fd.readable() => {
        let mut guard = match guard {
          Ok(guard) => guard,
          Err(_) => break,
        };
        let n = unsafe {
          libc::read(fd.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
        };
        if n > 0 {
          let n = n as usize;
          let mut framed = BytesMut::with_capacity(n + 2);
          framed.put_u16(n as u16);
          framed.put_slice(&buf[..n]);
          if let Some(flush) = agg.push(&framed) {
            peer.send(flush);
          }
        } else if n == 0 {
          break;
        } else if std::io::Error::last_os_error().kind() == std::io::ErrorKind::WouldBlock {
          guard.clear_ready();
        } else {
          debug!("tun read failed");
          break;
        }
      },

      incoming = inbox.recv() => match incoming {
        Some(data) => {
          for packet in split_packets(&data) {
            let written = unsafe {
              libc::write(fd.get_ref().as_raw_fd(), packet.as_ptr().cast(), packet.len())
            };
            if written < 0 {
              debug!("tun write failed, packet dropped");
            }
          }
        }
        None => break,
      },

      _ = keepalive.tick() => {
        all_peers.send_all(&Bytes::new());
      },

      _ = async { tokio::time::sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {
        if !agg.is_empty() {
          peer.send(agg.take());
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_packets_walks_length_prefixes() {
    let mut data = Vec::new();
    for packet in [b"abc".as_slice(), b"defgh".as_slice()] {
      data.extend_from_slice(&(packet.len() as u16).to_be_bytes());
      data.extend_from_slice(packet);
    }
    let packets = split_packets(&data);
    assert_eq!(packets, vec![b"abc".as_slice(), b"defgh".as_slice()]);
  }

  #[test]
  fn split_packets_drops_truncated_tail() {
    let mut data = Vec::new();
    data.extend_from_slice(&3u16.to_be_bytes());
    data.extend_from_slice(b"abc");
    data.extend_from_slice(&9u16.to_be_bytes());
    data.extend_from_slice(b"de"); // short
    assert_eq!(split_packets(&data), vec![b"abc".as_slice()]);
  }

  #[test]
  fn split_packets_handles_keepalive() {
    assert!(split_packets(&[]).is_empty());
  }
}
