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
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use base::records::StatsRecord;

use crate::agg::Aggregator;
use crate::encode_record;

/// Per-subscriber buffered frame backlog before the session is dropped as too slow.
const SESSION_BACKLOG: usize = 64;

/// TCP fan-out of aggregated stat records to CLI subscribers.
///
/// Every accepted connection first receives the `cli_title` frame, then each record the
/// aggregator broadcasts, in order. Incoming bytes are discarded; the direction is reserved.
pub struct StatsServer {
  listener: TcpListener,
  agg: Aggregator,
}

impl StatsServer {
  pub async fn bind(addr: SocketAddr, agg: Aggregator) -> std::io::Result<StatsServer> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "stats server listening");
    Ok(StatsServer { listener, agg })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Run the accept loop until the task is aborted.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        match self.listener.accept().await {
          Ok((stream, peer)) => {
            debug!(%peer, "cli subscriber connected");
            serve_session(stream, &self.agg);
          }
          Err(err) => {
            debug!(%err, "stats accept failed");
          }
        }
      }
    })
  }
}

fn serve_session(stream: TcpStream, agg: &Aggregator) {
  let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(SESSION_BACKLOG);

  let title = encode_record(&StatsRecord::CliTitle { cli_title: agg.cli_title() });
  if let Some(title) = title {
    // Queue is empty here, the send cannot fail.
    let _ = tx.try_send(title);
  }
  agg.add_session(tx);

  tokio::spawn(async move {
    let (mut read_half, mut write_half) = stream.into_split();

    // Reserved direction: drain and discard whatever the subscriber sends.
    let drain = tokio::spawn(async move {
      let mut sink = [0u8; 1024];
      while matches!(read_half.read(&mut sink).await, Ok(n) if n > 0) {}
    });

    while let Some(payload) = rx.recv().await {
      let len = (payload.len() as u32).to_be_bytes();
      if write_half.write_all(&len).await.is_err() || write_half.write_all(&payload).await.is_err() {
        break;
      }
    }

    drain.abort();
    // Dropping `rx` closes the channel; the aggregator evicts the session on its
    // next broadcast.
  });
}
