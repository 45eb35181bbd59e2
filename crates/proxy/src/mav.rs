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

//! MAVLink stream handling: the minimum this layer needs.
//!
//! The proxies split byte streams into MAVLink v1/v2 frames for hook dispatch and frame
//! aggregation, and synthesize RADIO_STATUS frames for RSSI injection. Everything else about
//! MAVLink stays opaque.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{PacketSender, PeerCell, ProxyError, PROXY_BACKLOG};

const MAV_MAGIC_V1: u8 = 0xfe;
const MAV_MAGIC_V2: u8 = 0xfd;
const MSG_HEARTBEAT: u32 = 0;
const MSG_RADIO_STATUS: u32 = 109;
const RADIO_STATUS_CRC_EXTRA: u8 = 185;
const MAV_MODE_FLAG_SAFETY_ARMED: u8 = 0x80;

/// Observes frames crossing a proxy in one direction.
pub type MavHook = Box<dyn FnMut(&[u8]) + Send>;

/// RSSI data pushed into a proxy by the aggregator's callback.
#[derive(Debug, Clone, Copy)]
pub struct RssiReport {
  pub rssi: u8,
  pub errors: u16,
  pub fec: u16,
  pub flags: u32,
}

/// Incremental MAVLink v1/v2 frame splitter.
///
/// Bytes that cannot start a frame are skipped one at a time until the stream resynchronizes
/// on a magic byte.
#[derive(Debug, Default)]
pub struct MavFrameSplitter {
  buf: Vec<u8>,
}

fn frame_len(buf: &[u8]) -> Option<usize> {
  match buf[0] {
    MAV_MAGIC_V1 => {
      if buf.len() < 2 {
        return None;
      }
      Some(8 + buf[1] as usize)
    }
    MAV_MAGIC_V2 => {
      if buf.len() < 3 {
        return None;
      }
      let signed = buf[2] & 0x01 != 0;
      Some(12 + buf[1] as usize + if signed { 13 } else { 0 })
    }
    _ => Some(0), // resync marker
  }
}

impl MavFrameSplitter {
  pub fn new() -> MavFrameSplitter {
    MavFrameSplitter::default()
  }

  /// Feed bytes, returning every complete frame they finish.
  pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
    self.buf.extend_from_slice(data);
    let mut frames = Vec::new();

    while !self.buf.is_empty() {
      match frame_len(&self.buf) {
        None => break, // need more header bytes
        Some(0) => {
          self.buf.remove(0);
        }
        Some(len) if self.buf.len() >= len => {
          let rest = self.buf.split_off(len);
          let frame = std::mem::replace(&mut self.buf, rest);
          frames.push(Bytes::from(frame));
        }
        Some(_) => break, // incomplete frame
      }
    }
    frames
  }
}

/// Message id of a complete frame.
pub fn frame_msgid(frame: &[u8]) -> Option<u32> {
  match frame.first()? {
    &MAV_MAGIC_V1 if frame.len() >= 6 => Some(frame[5] as u32),
    &MAV_MAGIC_V2 if frame.len() >= 10 => {
      Some(frame[7] as u32 | (frame[8] as u32) << 8 | (frame[9] as u32) << 16)
    }
    _ => None,
  }
}

/// For a HEARTBEAT frame, whether the safety-armed flag is set. `None` for other messages.
pub fn heartbeat_armed(frame: &[u8]) -> Option<bool> {
  if frame_msgid(frame)? != MSG_HEARTBEAT {
    return None;
  }
  let (header, payload_len) = match frame[0] {
    MAV_MAGIC_V1 => (6, frame[1] as usize),
    _ => (10, frame[1] as usize),
  };
  // base_mode sits at payload offset 6; v2 truncates trailing zero bytes.
  let base_mode = if payload_len > 6 && frame.len() > header + 6 { frame[header + 6] } else { 0 };
  Some(base_mode & MAV_MODE_FLAG_SAFETY_ARMED != 0)
}

fn crc_x25(data: &[u8], extra: u8) -> u16 {
  let mut crc: u16 = 0xffff;
  let mut accumulate = |byte: u8| {
    let tmp = byte ^ (crc & 0xff) as u8;
    let tmp = tmp ^ (tmp << 4);
    crc = (crc >> 8) ^ ((tmp as u16) << 8) ^ ((tmp as u16) << 3) ^ ((tmp as u16) >> 4);
  };
  for &b in data {
    accumulate(b);
  }
  accumulate(extra);
  crc
}

/// Build a MAVLink v1 RADIO_STATUS frame.
///
/// Link flags travel in the `remnoise` field, which this link has no other use for.
pub fn radio_status(sys_id: u8, comp_id: u8, seq: u8, report: RssiReport) -> Bytes {
  let mut frame = Vec::with_capacity(17);
  frame.push(MAV_MAGIC_V1);
  frame.push(9); // payload length
  frame.push(seq);
  frame.push(sys_id);
  frame.push(comp_id);
  frame.push(MSG_RADIO_STATUS as u8);
  frame.extend_from_slice(&report.errors.to_le_bytes()); // rxerrors
  frame.extend_from_slice(&report.fec.to_le_bytes()); // fixed
  frame.push(report.rssi);
  frame.push(report.rssi); // remrssi
  frame.push(100); // txbuf
  frame.push(0); // noise
  frame.push((report.flags & 0xff) as u8); // remnoise
  let crc = crc_x25(&frame[1..], RADIO_STATUS_CRC_EXTRA);
  frame.extend_from_slice(&crc.to_le_bytes());
  Bytes::from(frame)
}

/// Watches HEARTBEAT frames and runs external commands on ARM/DISARM transitions.
pub struct ArmDetector {
  armed: Option<bool>,
  on_arm: Option<String>,
  on_disarm: Option<String>,
}

impl ArmDetector {
  pub fn new(on_arm: Option<String>, on_disarm: Option<String>) -> ArmDetector {
    ArmDetector { armed: None, on_arm, on_disarm }
  }

  pub fn observe(&mut self, frame: &[u8]) {
    let Some(armed) = heartbeat_armed(frame) else { return };
    if self.armed == Some(armed) {
      return;
    }
    let first = self.armed.is_none();
    self.armed = Some(armed);
    if first && !armed {
      // Initial state reports are only interesting when the vehicle is already armed.
      return;
    }

    let cmd = if armed { self.on_arm.clone() } else { self.on_disarm.clone() };
    let Some(cmd) = cmd else { return };
    info!(armed, %cmd, "vehicle arm state changed");

    tokio::spawn(async move {
      match tokio::process::Command::new("/bin/sh").arg("-c").arg(&cmd).status().await {
        Ok(status) if status.success() => {}
        Ok(status) => error!(%cmd, ?status, "arm hook exited non-zero"),
        Err(err) => error!(%cmd, %err, "arm hook failed to start"),
      }
    });
  }
}

/// Size/timeout frame aggregation buffer.
pub(crate) struct AggBuf {
  buf: Vec<u8>,
  deadline: Option<tokio::time::Instant>,
  max_size: usize,
  timeout: Duration,
}

impl AggBuf {
  pub(crate) fn new(max_size: usize, timeout: Duration) -> AggBuf {
    AggBuf { buf: Vec::new(), deadline: None, max_size, timeout }
  }

  /// Append one frame; returns a flushed buffer when the size cap forces one out.
  pub(crate) fn push(&mut self, frame: &[u8]) -> Option<Bytes> {
    let mut flushed = None;
    if !self.buf.is_empty() && self.buf.len() + frame.len() > self.max_size {
      flushed = Some(self.take());
    }
    if self.buf.is_empty() {
      self.deadline = Some(tokio::time::Instant::now() + self.timeout);
    }
    self.buf.extend_from_slice(frame);
    flushed
  }

  pub(crate) fn take(&mut self) -> Bytes {
    self.deadline = None;
    Bytes::from(std::mem::take(&mut self.buf))
  }

  pub(crate) fn deadline(&self) -> Option<tokio::time::Instant> {
    self.deadline
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }
}

/// Construction parameters shared by the MAVLink proxies.
pub struct MavlinkOpts {
  /// Flush the aggregation buffer before it would exceed this many bytes (the radio MTU).
  pub agg_max_size: usize,
  /// Flush the aggregation buffer at this age even when under the size cap.
  pub agg_timeout: Duration,
  /// Synthesize RADIO_STATUS frames from the aggregator's RSSI callback.
  pub inject_rssi: bool,
  /// Mirror all radio-side traffic to this address (OSD).
  pub mirror: Option<SocketAddr>,
  pub sys_id: u8,
  pub comp_id: u8,
  pub rx_hooks: Vec<MavHook>,
  pub tx_hooks: Vec<MavHook>,
}

/// MAVLink-aware UDP proxy.
///
/// The user side (GCS or autopilot) is the socket; the radio side is the peer. Frames from the
/// user are aggregated up to `agg_max_size` bytes or `agg_timeout`, whichever comes first, so
/// small telemetry messages share radio frames.
pub struct MavlinkUdpProxy {
  sender: PacketSender,
  peer: PeerCell,
  rssi: tokio::sync::mpsc::Sender<RssiReport>,
  local_addr: SocketAddr,
  task: JoinHandle<()>,
}

impl MavlinkUdpProxy {
  /// Bind `addr`; `connect` fixes the user-side destination when this end initiates.
  pub async fn bind(
    addr: SocketAddr,
    connect: Option<SocketAddr>,
    opts: MavlinkOpts,
  ) -> Result<MavlinkUdpProxy, ProxyError> {
    let socket = UdpSocket::bind(addr).await.map_err(ProxyError::Bind)?;
    let local_addr = socket.local_addr().map_err(ProxyError::Bind)?;
    debug!(%local_addr, ?connect, "mavlink udp proxy up");

    let peer = PeerCell::new();
    let (sender, inbox) = tokio::sync::mpsc::channel::<Bytes>(PROXY_BACKLOG);
    let (rssi, rssi_rx) = tokio::sync::mpsc::channel::<RssiReport>(PROXY_BACKLOG);

    let task = tokio::spawn(run_udp(socket, connect, opts, peer.clone(), inbox, rssi_rx));
    Ok(MavlinkUdpProxy { sender, peer, rssi, local_addr, task })
  }

  pub fn sender(&self) -> PacketSender {
    self.sender.clone()
  }

  pub fn peer(&self) -> PeerCell {
    self.peer.clone()
  }

  /// Sender registered with the aggregator as this proxy's RSSI callback.
  pub fn rssi_sender(&self) -> tokio::sync::mpsc::Sender<RssiReport> {
    self.rssi.clone()
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
}

impl Drop for MavlinkUdpProxy {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn run_udp(
  socket: UdpSocket,
  connect: Option<SocketAddr>,
  mut opts: MavlinkOpts,
  peer: PeerCell,
  mut inbox: tokio::sync::mpsc::Receiver<Bytes>,
  mut rssi_rx: tokio::sync::mpsc::Receiver<RssiReport>,
) {
  let mut user_stream = MavFrameSplitter::new();
  let mut radio_stream = MavFrameSplitter::new();
  let mut agg = AggBuf::new(opts.agg_max_size, opts.agg_timeout);
  let mut reply_to: Option<SocketAddr> = None;
  let mut rssi_open = opts.inject_rssi;
  let mut seq: u8 = 0;
  let mut buf = vec![0u8; 65536];

  loop {
    let deadline = agg.deadline();
    tokio::select! {
      received = socket.recv_from(&mut buf) => match received {
        Ok((len, from)) => {
          if connect.is_none() {
            reply_to = Some(from);
          }
          for frame in user_stream.push(&buf[..len]) {
            for hook in opts.tx_hooks.iter_mut() {
              hook(&frame);
            }
            if let Some(flush) = agg.push(&frame) {
              peer.send(flush);
            }
          }
        }
        Err(err) => debug!(%err, "mavlink udp recv failed"),
      },

      incoming = inbox.recv() => match incoming {
        Some(data) => {
          for frame in radio_stream.push(&data) {
            for hook in opts.rx_hooks.iter_mut() {
              hook(&frame);
            }
          }
          if let Some(dst) = connect.or(reply_to) {
            let _ = socket.send_to(&data, dst).await;
          }
          if let Some(mirror) = opts.mirror {
            let _ = socket.send_to(&data, mirror).await;
          }
        }
        None => break,
      },

      report = rssi_rx.recv(), if rssi_open => match report {
        Some(report) => {
          let frame = radio_status(opts.sys_id, opts.comp_id, seq, report);
          seq = seq.wrapping_add(1);
          if let Some(dst) = connect.or(reply_to) {
            let _ = socket.send_to(&frame, dst).await;
          }
          if let Some(mirror) = opts.mirror {
            let _ = socket.send_to(&frame, mirror).await;
          }
        }
        None => rssi_open = false,
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

  fn v1_frame(msgid: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![MAV_MAGIC_V1, payload.len() as u8, 0, 1, 1, msgid];
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[0xaa, 0xbb]); // crc not validated at this layer
    frame
  }

  fn heartbeat(base_mode: u8) -> Vec<u8> {
    let mut payload = [0u8; 9];
    payload[6] = base_mode;
    v1_frame(0, &payload)
  }

  #[test]
  fn splitter_handles_partial_and_concatenated_frames() {
    let mut splitter = MavFrameSplitter::new();
    let a = v1_frame(0, &[0; 9]);
    let b = v1_frame(30, &[0; 28]);
    let mut stream = a.clone();
    stream.extend_from_slice(&b);

    let (head, tail) = stream.split_at(a.len() + 3);
    assert_eq!(splitter.push(head).len(), 1);
    let rest = splitter.push(tail);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].as_ref(), b.as_slice());
  }

  #[test]
  fn splitter_resyncs_after_garbage() {
    let mut splitter = MavFrameSplitter::new();
    let mut stream = vec![0x00, 0x42, 0x13];
    stream.extend_from_slice(&heartbeat(0));
    let frames = splitter.push(&stream);
    assert_eq!(frames.len(), 1);
    assert_eq!(frame_msgid(&frames[0]), Some(0));
  }

  #[test]
  fn splitter_parses_v2_frames() {
    let mut splitter = MavFrameSplitter::new();
    // v2: magic, len, incompat, compat, seq, sysid, compid, msgid[3], payload, crc
    let mut frame = vec![MAV_MAGIC_V2, 2, 0, 0, 0, 1, 1, 109, 0, 0];
    frame.extend_from_slice(&[0x11, 0x22, 0xcc, 0xdd]);
    let frames = splitter.push(&frame);
    assert_eq!(frames.len(), 1);
    assert_eq!(frame_msgid(&frames[0]), Some(109));
  }

  #[test]
  fn heartbeat_arm_bit() {
    assert_eq!(heartbeat_armed(&heartbeat(0x80)), Some(true));
    assert_eq!(heartbeat_armed(&heartbeat(0x00)), Some(false));
    assert_eq!(heartbeat_armed(&v1_frame(30, &[0; 28])), None);
  }

  #[test]
  fn radio_status_layout() {
    let report = RssiReport { rssi: 196, errors: 7, fec: 3, flags: 2 };
    let frame = radio_status(42, 68, 9, report);
    assert_eq!(frame.len(), 17);
    assert_eq!(frame[0], MAV_MAGIC_V1);
    assert_eq!(frame[1], 9);
    assert_eq!(frame[2], 9); // seq
    assert_eq!(frame[3], 42);
    assert_eq!(frame[4], 68);
    assert_eq!(frame[5], 109);
    assert_eq!(u16::from_le_bytes([frame[6], frame[7]]), 7); // rxerrors
    assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 3); // fixed
    assert_eq!(frame[10], 196); // rssi
    assert_eq!(frame[11], 196); // remrssi
    assert_eq!(frame[12], 100); // txbuf
    assert_eq!(frame[14], 2); // remnoise carries the link flags
    assert_eq!(frame_msgid(&frame), Some(109));
  }

  #[test]
  fn agg_buf_flushes_on_size() {
    let mut agg = AggBuf::new(32, Duration::from_secs(1));
    assert!(agg.push(&[1u8; 20]).is_none());
    let flushed = agg.push(&[2u8; 20]).expect("size cap must flush");
    assert_eq!(flushed.len(), 20);
    assert_eq!(agg.take().len(), 20);
  }

  #[tokio::test]
  async fn udp_proxy_aggregates_user_frames_to_peer() {
    let opts = MavlinkOpts {
      agg_max_size: 1445,
      agg_timeout: Duration::from_millis(20),
      inject_rssi: false,
      mirror: None,
      sys_id: 3,
      comp_id: 68,
      rx_hooks: Vec::new(),
      tx_hooks: Vec::new(),
    };
    let proxy = MavlinkUdpProxy::bind("127.0.0.1:0".parse().unwrap(), None, opts).await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    proxy.peer().set(tx);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let h = heartbeat(0);
    client.send_to(&h, proxy.local_addr()).await.unwrap();
    client.send_to(&h, proxy.local_addr()).await.unwrap();

    // Both frames land in one aggregated packet once the timeout expires.
    let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(packet.len(), h.len() * 2);
  }

  #[tokio::test]
  async fn rssi_injection_reaches_the_user() {
    let opts = MavlinkOpts {
      agg_max_size: 1445,
      agg_timeout: Duration::from_millis(20),
      inject_rssi: true,
      mirror: None,
      sys_id: 3,
      comp_id: 68,
      rx_hooks: Vec::new(),
      tx_hooks: Vec::new(),
    };
    let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let proxy = MavlinkUdpProxy::bind(
      "127.0.0.1:0".parse().unwrap(),
      Some(user.local_addr().unwrap()),
      opts,
    )
    .await
    .unwrap();

    proxy
      .rssi_sender()
      .send(RssiReport { rssi: 128, errors: 0, fec: 0, flags: 1 })
      .await
      .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) =
      tokio::time::timeout(Duration::from_secs(1), user.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(frame_msgid(&buf[..len]), Some(109));
  }
}
