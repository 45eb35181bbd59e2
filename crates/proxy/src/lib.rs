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

//! User-space dataplane proxies.
//!
//! Each proxy owns exactly one socket, serial port or tunnel device and runs as one task.
//! Proxies hand packets to each other through [`PacketSender`] channels; the *peer* of a proxy
//! is swappable at runtime through a [`PeerCell`], which is how the TX antenna selector
//! redirects traffic between NICs without touching the proxies themselves.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

pub mod fanout;
pub mod mav;
pub mod serial;
pub mod tun;
pub mod udp;

/// Packet handoff into a proxy.
pub type PacketSender = tokio::sync::mpsc::Sender<Bytes>;

/// Packets a proxy will buffer before new ones are dropped (datagram semantics).
pub const PROXY_BACKLOG: usize = 128;

#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("socket bind failed: {0}")]
  Bind(#[source] std::io::Error),

  #[error("serial open failed for {dev}: {source}")]
  SerialOpen {
    dev: String,
    #[source]
    source: std::io::Error,
  },

  #[error("unsupported baud rate {0}")]
  Baud(u32),

  #[error("tunnel creation failed: {0}")]
  Tun(#[source] std::io::Error),

  #[error("interface configuration failed: {0}")]
  IfConfig(String),
}

/// A swappable reference to the downstream peer of a proxy.
///
/// The antenna-selection callback swaps the referent while the owning proxy keeps forwarding;
/// the swap is a single atomic pointer store from the forwarding path's point of view.
#[derive(Clone, Default)]
pub struct PeerCell {
  inner: Arc<Mutex<Option<PacketSender>>>,
}

impl PeerCell {
  pub fn new() -> PeerCell {
    PeerCell::default()
  }

  pub fn set(&self, peer: PacketSender) {
    *self.inner.lock().unwrap() = Some(peer);
  }

  /// Forward one packet to the current peer, if any. Backpressure drops the packet: a slow
  /// peer must never stall the socket loop.
  pub fn send(&self, packet: Bytes) {
    if let Some(peer) = self.inner.lock().unwrap().as_ref() {
      let _ = peer.try_send(packet);
    }
  }
}

/// A broadcast list of peers, used for tunnel keep-alives that must reach every NIC.
#[derive(Clone, Default)]
pub struct PeerList {
  inner: Arc<Mutex<Vec<PacketSender>>>,
}

impl PeerList {
  pub fn new() -> PeerList {
    PeerList::default()
  }

  pub fn set(&self, peers: Vec<PacketSender>) {
    *self.inner.lock().unwrap() = peers;
  }

  pub fn send_all(&self, packet: &Bytes) {
    for peer in self.inner.lock().unwrap().iter() {
      let _ = peer.try_send(packet.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn peer_cell_swap_redirects_traffic() {
    let cell = PeerCell::new();
    let (a_tx, mut a_rx) = tokio::sync::mpsc::channel(4);
    let (b_tx, mut b_rx) = tokio::sync::mpsc::channel(4);

    cell.send(Bytes::from_static(b"dropped")); // no peer yet

    cell.set(a_tx);
    cell.send(Bytes::from_static(b"one"));
    cell.set(b_tx);
    cell.send(Bytes::from_static(b"two"));

    assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"one"));
    assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    assert!(a_rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn peer_list_broadcasts() {
    let list = PeerList::new();
    let (a_tx, mut a_rx) = tokio::sync::mpsc::channel(4);
    let (b_tx, mut b_rx) = tokio::sync::mpsc::channel(4);
    list.set(vec![a_tx, b_tx]);

    list.send_all(&Bytes::from_static(b"ka"));
    assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"ka"));
    assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"ka"));
  }
}
