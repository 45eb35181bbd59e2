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

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{error, info};

/// Frames queued ahead of the log thread before new frames are dropped.
const LOG_BACKLOG: usize = 256;

/// Rotating binary stats log.
///
/// The log is a gzip stream whose uncompressed body is a concatenation of
/// `u32-big-endian length || payload` frames, identical to the stats wire format. A fresh
/// timestamp-named file is opened on every process start so a crash can never leave a reader
/// mid-frame. All I/O happens on a dedicated thread; write errors are logged and discarded,
/// so the control plane never stalls on the log.
pub struct BinLog {
  sender: SyncSender<Bytes>,
  handle: Option<JoinHandle<()>>,
}

impl BinLog {
  /// Open `<dir>/<base>.<YYYYMMDD-HHMMSS>` and start the writer thread.
  pub fn open(base: &str, dir: &Path, flush_delay: Duration) -> std::io::Result<BinLog> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{base}.{stamp}"));
    info!(path = %path.display(), "open binary log");

    let file = File::create(&path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());

    let (sender, receiver) = std::sync::mpsc::sync_channel::<Bytes>(LOG_BACKLOG);
    let handle = std::thread::spawn(move || {
      let mut failed = false;
      loop {
        match receiver.recv_timeout(flush_delay) {
          Ok(payload) => {
            let len = (payload.len() as u32).to_be_bytes();
            let result = encoder.write_all(&len).and_then(|_| encoder.write_all(&payload));
            if let Err(err) = result {
              if !failed {
                error!(%err, "binary log write failed, dropping frames");
              }
              failed = true;
            }
          }
          Err(RecvTimeoutError::Timeout) => {
            if let Err(err) = encoder.flush() {
              if !failed {
                error!(%err, "binary log flush failed");
              }
              failed = true;
            }
          }
          Err(RecvTimeoutError::Disconnected) => break,
        }
      }
      if let Err(err) = encoder.finish().and_then(|mut f| f.flush()) {
        error!(%err, "binary log close failed");
      }
    });

    Ok(BinLog { sender, handle: Some(handle) })
  }

  /// The sender side handed to the aggregator as its sentinel subscriber.
  pub fn sender(&self) -> SyncSender<Bytes> {
    self.sender.clone()
  }

  /// Flush and close the log, waiting for the writer thread.
  pub fn close(mut self) {
    drop(std::mem::replace(&mut self.sender, std::sync::mpsc::sync_channel(1).0));
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}
