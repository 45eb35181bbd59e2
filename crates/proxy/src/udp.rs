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

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{PacketSender, PeerCell, ProxyError, PROXY_BACKLOG};

/// Plain datagram proxy.
///
/// Ingress datagrams are forwarded to the current peer; packets handed in by peers go out the
/// socket. The destination is either fixed (`to`) or learned from the most recent ingress
/// datagram, so a `listen://` service answers whoever talked to it last.
pub struct UdpProxy {
  sender: PacketSender,
  peer: PeerCell,
  local_addr: SocketAddr,
  task: JoinHandle<()>,
}

impl UdpProxy {
  /// Bind `addr` (port 0 for ephemeral) and start forwarding. `to` fixes the egress
  /// destination.
  pub async fn bind(addr: SocketAddr, to: Option<SocketAddr>) -> Result<UdpProxy, ProxyError> {
    let socket = UdpSocket::bind(addr).await.map_err(ProxyError::Bind)?;
    let local_addr = socket.local_addr().map_err(ProxyError::Bind)?;
    debug!(%local_addr, ?to, "udp proxy up");

    let peer = PeerCell::new();
    let (sender, mut inbox) = tokio::sync::mpsc::channel::<Bytes>(PROXY_BACKLOG);

    let task = {
      let peer = peer.clone();
      tokio::spawn(async move {
        let mut reply_to: Option<SocketAddr> = None;
        let mut buf = vec![0u8; 65536];
        loop {
          tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
              Ok((len, from)) => {
                if to.is_none() {
                  reply_to = Some(from);
                }
                peer.send(Bytes::copy_from_slice(&buf[..len]));
              }
              Err(err) => {
                debug!(%err, "udp recv failed");
              }
            },
            outgoing = inbox.recv() => match outgoing {
              Some(packet) => {
                if let Some(dst) = to.or(reply_to) {
                  let _ = socket.send_to(&packet, dst).await;
                }
              }
              None => break,
            },
          }
        }
      })
    };

    Ok(UdpProxy { sender, peer, local_addr, task })
  }

  /// Handle peers use to push packets out this proxy's socket.
  pub fn sender(&self) -> PacketSender {
    self.sender.clone()
  }

  /// The swappable peer receiving this proxy's ingress traffic.
  pub fn peer(&self) -> PeerCell {
    self.peer.clone()
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn local_port(&self) -> u16 {
    self.local_addr.port()
  }
}

impl Drop for UdpProxy {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  async fn ephemeral() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
  }

  #[tokio::test]
  async fn forwards_ingress_to_peer() {
    let proxy = UdpProxy::bind(ephemeral().await, None).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    proxy.peer().set(tx);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", proxy.local_addr()).await.unwrap();

    let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(packet, Bytes::from_static(b"ping"));
  }

  #[tokio::test]
  async fn sends_peer_packets_to_fixed_destination() {
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let proxy = UdpProxy::bind(ephemeral().await, Some(sink.local_addr().unwrap())).await.unwrap();

    proxy.sender().send(Bytes::from_static(b"pong")).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, _) =
      tokio::time::timeout(Duration::from_secs(1), sink.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], b"pong");
  }

  #[tokio::test]
  async fn learns_reply_address_without_fixed_destination() {
    let proxy = UdpProxy::bind(ephemeral().await, None).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    proxy.peer().set(tx);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello", proxy.local_addr()).await.unwrap();
    rx.recv().await.unwrap();

    proxy.sender().send(Bytes::from_static(b"reply")).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) =
      tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], b"reply");
    assert_eq!(from, proxy.local_addr());
  }

  #[tokio::test]
  async fn drop_stops_the_socket_task() {
    let proxy = UdpProxy::bind(ephemeral().await, None).await.unwrap();
    let addr = proxy.local_addr();
    drop(proxy);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The port is free again: a fresh bind to the same address succeeds.
    let rebound = UdpSocket::bind(addr).await;
    assert!(rebound.is_ok());
  }
}
