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
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mav::MavHook;
use crate::{PacketSender, ProxyError, PROXY_BACKLOG};

/// TCP fan-out of MAVLink frames.
///
/// Every frame handed to [`MavlinkTcpFanout::hook`] is written, as a raw MAVLink byte stream,
/// to all currently connected TCP clients. Slow or gone clients are dropped.
pub struct MavlinkTcpFanout {
  clients: Arc<Mutex<Vec<PacketSender>>>,
  local_addr: SocketAddr,
  task: JoinHandle<()>,
}

impl MavlinkTcpFanout {
  pub async fn bind(addr: SocketAddr) -> Result<MavlinkTcpFanout, ProxyError> {
    let listener = TcpListener::bind(addr).await.map_err(ProxyError::Bind)?;
    let local_addr = listener.local_addr().map_err(ProxyError::Bind)?;
    info!(addr = %local_addr, "mavlink tcp fan-out listening");

    let clients: Arc<Mutex<Vec<PacketSender>>> = Arc::new(Mutex::new(Vec::new()));
    let accept_clients = clients.clone();

    let task = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((mut stream, peer)) => {
            debug!(%peer, "mavlink tcp client connected");
            let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(PROXY_BACKLOG);
            accept_clients.lock().unwrap().push(tx);
            tokio::spawn(async move {
              while let Some(frame) = rx.recv().await {
                if stream.write_all(&frame).await.is_err() {
                  break;
                }
              }
            });
          }
          Err(err) => debug!(%err, "mavlink tcp accept failed"),
        }
      }
    });

    Ok(MavlinkTcpFanout { clients, local_addr, task })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// A hook that broadcasts each observed frame to every connected client.
  pub fn hook(&self) -> MavHook {
    let clients = self.clients.clone();
    Box::new(move |frame| {
      let frame = Bytes::copy_from_slice(frame);
      clients.lock().unwrap().retain(|client| client.try_send(frame.clone()).is_ok());
    })
  }
}

impl Drop for MavlinkTcpFanout {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpStream;

  #[tokio::test]
  async fn frames_reach_every_client() {
    let fanout = MavlinkTcpFanout::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = fanout.local_addr();

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut hook = fanout.hook();
    hook(b"\xfe\x00frame");

    for client in [&mut a, &mut b] {
      let mut buf = [0u8; 7];
      client.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"\xfe\x00frame");
    }
  }
}
