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

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use bytes::Bytes;
use nix::sys::termios::{cfmakeraw, cfsetspeed, tcgetattr, tcsetattr, BaudRate, SetArg};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mav::{MavFrameSplitter, MavlinkOpts, RssiReport};
use crate::{PacketSender, PeerCell, ProxyError, PROXY_BACKLOG};

fn baud_rate(baud: u32) -> Result<BaudRate, ProxyError> {
  Ok(match baud {
    9600 => BaudRate::B9600,
    19200 => BaudRate::B19200,
    38400 => BaudRate::B38400,
    57600 => BaudRate::B57600,
    115200 => BaudRate::B115200,
    230400 => BaudRate::B230400,
    460800 => BaudRate::B460800,
    500000 => BaudRate::B500000,
    921600 => BaudRate::B921600,
    1000000 => BaudRate::B1000000,
    1500000 => BaudRate::B1500000,
    other => return Err(ProxyError::Baud(other)),
  })
}

/// Open `/dev/<dev>` raw, non-blocking and exclusive at the requested baud.
fn open_port(dev: &str, baud: u32) -> Result<OwnedFd, ProxyError> {
  let path = Path::new("/dev").join(dev);
  let serial_err = |source: std::io::Error| ProxyError::SerialOpen { dev: dev.to_string(), source };

  let file = std::fs::OpenOptions::new()
    .read(true)
    .write(true)
    .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
    .open(&path)
    .map_err(serial_err)?;
  let fd: OwnedFd = file.into();

  // Exclusive access: a second open of the device fails until we close it.
  if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCEXCL) } < 0 {
    return Err(serial_err(std::io::Error::last_os_error()));
  }

  let mut termios = tcgetattr(&fd).map_err(|e| serial_err(e.into()))?;
  cfmakeraw(&mut termios);
  cfsetspeed(&mut termios, baud_rate(baud)?).map_err(|e| serial_err(e.into()))?;
  tcsetattr(&fd, SetArg::TCSANOW, &termios).map_err(|e| serial_err(e.into()))?;

  info!(dev, baud, "serial port open");
  Ok(fd)
}

/// MAVLink-aware serial proxy: the same aggregation and RSSI-injection semantics as
/// [`crate::mav::MavlinkUdpProxy`], with an exclusive serial port as the user side.
pub struct MavlinkSerialProxy {
  sender: PacketSender,
  peer: PeerCell,
  rssi: tokio::sync::mpsc::Sender<RssiReport>,
  task: JoinHandle<()>,
}

impl MavlinkSerialProxy {
  pub fn open(dev: &str, baud: u32, opts: MavlinkOpts) -> Result<MavlinkSerialProxy, ProxyError> {
    let fd = open_port(dev, baud)?;

    let peer = PeerCell::new();
    let (sender, inbox) = tokio::sync::mpsc::channel::<Bytes>(PROXY_BACKLOG);
    let (rssi, rssi_rx) = tokio::sync::mpsc::channel::<RssiReport>(PROXY_BACKLOG);

    let task = tokio::spawn(run_serial(fd, opts, peer.clone(), inbox, rssi_rx));
    Ok(MavlinkSerialProxy { sender, peer, rssi, task })
  }

  pub fn sender(&self) -> PacketSender {
    self.sender.clone()
  }

  pub fn peer(&self) -> PeerCell {
    self.peer.clone()
  }

  pub fn rssi_sender(&self) -> tokio::sync::mpsc::Sender<RssiReport> {
    self.rssi.clone()
  }
}

impl Drop for MavlinkSerialProxy {
  fn drop(&mut self) {
    self.task.abort();
  }
}

fn write_fd(fd: &AsyncFd<OwnedFd>, data: &[u8]) {
  // Serial writes are small; a full output buffer drops the frame rather than stalling.
  let n = unsafe { libc::write(fd.get_ref().as_raw_fd(), data.as_ptr().cast(), data.len()) };
  if n < 0 {
    debug!("serial write failed");
  }
}

async fn run_serial(
  fd: OwnedFd,
  mut opts: MavlinkOpts,
  peer: PeerCell,
  mut inbox: tokio::sync::mpsc::Receiver<Bytes>,
  mut rssi_rx: tokio::sync::mpsc::Receiver<RssiReport>,
) {
  let fd = match AsyncFd::new(fd) {
    Ok(fd) => fd,
    Err(err) => {
      debug!(%err, "serial fd registration failed");
      return;
    }
  };

  let mut user_stream = MavFrameSplitter::new();
  let mut radio_stream = MavFrameSplitter::new();
  let mut agg = crate::mav::AggBuf::new(opts.agg_max_size, opts.agg_timeout);
  let mut rssi_open = opts.inject_rssi;
  let mut seq: u8 = 0;
  let mut buf = vec![0u8; 4096];

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
          for frame in user_stream.push(&buf[..n as usize]) {
            for hook in opts.tx_hooks.iter_mut() {
              hook(&frame);
            }
            if let Some(flush) = agg.push(&frame) {
              peer.send(flush);
            }
          }
        } else if n == 0 {
          break;
        } else if std::io::Error::last_os_error().kind() == std::io::ErrorKind::WouldBlock {
          guard.clear_ready();
        } else {
          debug!("serial read failed");
          break;
        }
      },

      incoming = inbox.recv() => match incoming {
        Some(data) => {
          for frame in radio_stream.push(&data) {
            for hook in opts.rx_hooks.iter_mut() {
              hook(&frame);
            }
          }
          write_fd(&fd, &data);
        }
        None => break,
      },

      report = rssi_rx.recv(), if rssi_open => match report {
        Some(report) => {
          let frame = crate::mav::radio_status(opts.sys_id, opts.comp_id, seq, report);
          seq = seq.wrapping_add(1);
          write_fd(&fd, &frame);
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

  #[test]
  fn common_baud_rates_map() {
    assert!(baud_rate(57600).is_ok());
    assert!(baud_rate(115200).is_ok());
    assert!(matches!(baud_rate(1234), Err(ProxyError::Baud(1234))));
  }

  #[test]
  fn missing_device_is_a_proxy_error() {
    match open_port("surely-does-not-exist-0", 115200) {
      Err(ProxyError::SerialOpen { dev, .. }) => assert_eq!(dev, "surely-does-not-exist-0"),
      Err(other) => panic!("unexpected error: {other}"),
      Ok(_) => panic!("open unexpectedly succeeded"),
    }
  }
}
