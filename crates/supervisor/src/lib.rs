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

//! Worker process lifecycle.
//!
//! Each `wfb_rx` / `wfb_tx` worker is a child process with stdin writable and stdout/stderr
//! piped back. Stdout is framed into lines and fed through the matching telemetry parser;
//! stderr lines are logged verbatim, prefixed with the worker id. A clean exit resolves
//! `Ok(())`; anything else surfaces as [`WorkerError::ExitedNonZero`]. Pending port discovery
//! promises are cancelled when the worker dies before fulfilling them.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use telemetry::frame::LineFramer;
use telemetry::rx::{RxEvent, RxParser};
use telemetry::tx::{TxEvent, TxParser};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("failed to spawn {id}: {source}")]
  Spawn {
    id: String,
    #[source]
    source: std::io::Error,
  },

  #[error("worker {id} exited with code {code:?}, signal {signal:?}")]
  ExitedNonZero { id: String, code: Option<i32>, signal: Option<i32> },

  #[error("worker {id} exited before completing startup")]
  WorkerExited { id: String },

  #[error("i/o failure observing {id}: {source}")]
  Io {
    id: String,
    #[source]
    source: std::io::Error,
  },
}

/// A promise for a value the worker reports during startup.
///
/// Fulfilled at most once; if the worker exits first, waiting fails with
/// [`WorkerError::WorkerExited`].
pub struct Promise<T> {
  id: String,
  rx: oneshot::Receiver<T>,
}

impl<T> Promise<T> {
  pub async fn wait(self) -> Result<T, WorkerError> {
    self.rx.await.map_err(|_| WorkerError::WorkerExited { id: self.id })
  }
}

/// Per-NIC ephemeral UDP input ports announced by a TX worker.
pub type TxPorts = HashMap<String, u16>;

struct WorkerCore {
  id: String,
  child: Child,
  pumps: Vec<JoinHandle<()>>,
}

fn spawn_child(id: &str, argv: &[String], envs: &[(String, String)]) -> Result<Child, WorkerError> {
  let mut cmd = Command::new(&argv[0]);
  cmd
    .args(&argv[1..])
    .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
  let child = cmd.spawn().map_err(|source| WorkerError::Spawn { id: id.to_string(), source })?;
  info!(worker = id, "started");
  Ok(child)
}

impl WorkerCore {
  fn start(
    id: &str,
    argv: &[String],
    envs: &[(String, String)],
    mut on_line: impl FnMut(&str) + Send + 'static,
  ) -> Result<WorkerCore, WorkerError> {
    let mut child = spawn_child(id, argv, envs)?;
    let mut pumps = Vec::with_capacity(2);

    // stdout → line framer → telemetry parser
    if let Some(mut stdout) = child.stdout.take() {
      pumps.push(tokio::spawn(async move {
        let mut framer = LineFramer::new();
        let mut buf = [0u8; 4096];
        loop {
          match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
              for line in framer.push(&buf[..n]) {
                on_line(&line);
              }
            }
          }
        }
      }));
    }

    // stderr → diagnostic log, one line at a time
    if let Some(stderr) = child.stderr.take() {
      let worker = id.to_string();
      pumps.push(tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
          info!(worker = %worker, "{line}");
        }
      }));
    }

    Ok(WorkerCore { id: id.to_string(), child, pumps })
  }

  async fn wait(&mut self) -> Result<(), WorkerError> {
    let status = self
      .child
      .wait()
      .await
      .map_err(|source| WorkerError::Io { id: self.id.clone(), source })?;

    // Drain the stdio pumps so trailing telemetry is processed before the exit resolves.
    for pump in self.pumps.drain(..) {
      let _ = pump.await;
    }

    let code = status.code();
    info!(worker = %self.id, code = ?code, "stopped");

    if code == Some(0) {
      Ok(())
    } else {
      let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
      };
      Err(WorkerError::ExitedNonZero { id: self.id.clone(), code, signal })
    }
  }

  async fn stop(&mut self, grace: Duration) {
    if let Some(pid) = self.child.id() {
      debug!(worker = %self.id, pid, "terminating");
      let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
      if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
        let _ = self.child.kill().await;
      }
    }
  }
}

/// A supervised `wfb_rx` process.
pub struct RxWorker {
  core: WorkerCore,
}

impl RxWorker {
  /// Spawn the worker, routing parsed RX telemetry events into `on_event`.
  pub fn start(
    id: &str,
    argv: &[String],
    envs: &[(String, String)],
    mut on_event: impl FnMut(RxEvent) + Send + 'static,
  ) -> Result<RxWorker, WorkerError> {
    let worker = id.to_string();
    let mut parser = RxParser::new();
    let core = WorkerCore::start(id, argv, envs, move |line| match parser.feed_line(line) {
      Ok(Some(event)) => on_event(event),
      Ok(None) => {}
      Err(bad) => error!(worker = %worker, line = %bad.line, "bad telemetry"),
    })?;
    Ok(RxWorker { core })
  }

  /// Resolve when the worker exits; non-zero exit is an error.
  pub async fn wait(&mut self) -> Result<(), WorkerError> {
    self.core.wait().await
  }

  /// SIGTERM, bounded grace, then SIGKILL.
  pub async fn stop(&mut self, grace: Duration) {
    self.core.stop(grace).await
  }
}

/// A supervised `wfb_tx` process.
///
/// In addition to stats windows, the TX worker announces its ephemeral per-NIC input ports
/// and (optionally) an ephemeral control port during startup; both are exposed as promises.
pub struct TxWorker {
  core: WorkerCore,
}

impl TxWorker {
  /// Spawn the worker.
  ///
  /// `want_control_port` reflects a `control_port = 0` service configuration, i.e. the worker
  /// was asked to pick an ephemeral control port and report it back.
  pub fn start(
    id: &str,
    argv: &[String],
    envs: &[(String, String)],
    want_control_port: bool,
    mut on_event: impl FnMut(TxEvent) + Send + 'static,
  ) -> Result<(TxWorker, Promise<TxPorts>, Option<Promise<u16>>), WorkerError> {
    let worker = id.to_string();
    let mut parser = TxParser::new();

    let (ports_tx, ports_rx) = oneshot::channel();
    let mut ports_tx = Some(ports_tx);
    let (control_tx, control_rx) = oneshot::channel();
    let mut control_tx = want_control_port.then_some(control_tx);

    let core = WorkerCore::start(id, argv, envs, move |line| match parser.feed_line(line) {
      Ok(Some(TxEvent::PortsReady(ports))) => {
        if let Some(tx) = ports_tx.take() {
          let _ = tx.send(ports);
        }
      }
      Ok(Some(TxEvent::ControlPort(port))) => {
        if let Some(tx) = control_tx.take() {
          let _ = tx.send(port);
        }
      }
      Ok(Some(event)) => on_event(event),
      Ok(None) => {}
      Err(bad) => error!(worker = %worker, line = %bad.line, "bad telemetry"),
    })?;

    let ports = Promise { id: id.to_string(), rx: ports_rx };
    let control = want_control_port.then(|| Promise { id: id.to_string(), rx: control_rx });
    Ok((TxWorker { core }, ports, control))
  }

  /// Resolve when the worker exits; non-zero exit is an error.
  pub async fn wait(&mut self) -> Result<(), WorkerError> {
    self.core.wait().await
  }

  /// SIGTERM, bounded grace, then SIGKILL.
  pub async fn stop(&mut self, grace: Duration) {
    self.core.stop(grace).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
  }

  #[tokio::test]
  async fn rx_worker_feeds_parser_and_exits_clean() {
    let (tx, rx) = mpsc::channel();
    let mut worker = RxWorker::start(
      "test rx",
      &sh("printf '1\\tPKT\\t5:100:0:5:0:0:0:5:100\\n'"),
      &[],
      move |event| {
        let _ = tx.send(event);
      },
    )
    .unwrap();

    worker.wait().await.unwrap();
    match rx.try_recv().unwrap() {
      RxEvent::Update { packets, .. } => assert_eq!(packets.all, (5, 5)),
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[tokio::test]
  async fn nonzero_exit_is_an_error() {
    let mut worker = RxWorker::start("test rx", &sh("exit 3"), &[], |_| {}).unwrap();
    match worker.wait().await {
      Err(WorkerError::ExitedNonZero { code: Some(3), .. }) => {}
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn tx_ports_promise_resolves() {
    let (mut worker, ports, control) = TxWorker::start(
      "test tx",
      &sh("printf '1\\tLISTEN_UDP\\t5000:wlan0\\n1\\tLISTEN_UDP_END\\n'; sleep 0.2"),
      &[],
      false,
      |_| {},
    )
    .unwrap();
    assert!(control.is_none());

    let ports = ports.wait().await.unwrap();
    assert_eq!(ports.get("wlan0"), Some(&5000));
    worker.wait().await.unwrap();
  }

  #[tokio::test]
  async fn early_exit_cancels_port_promise() {
    let (mut worker, ports, control) =
      TxWorker::start("test tx", &sh("exit 1"), &[], true, |_| {}).unwrap();

    let wait = worker.wait().await;
    assert!(wait.is_err());
    match ports.wait().await {
      Err(WorkerError::WorkerExited { id }) => assert_eq!(id, "test tx"),
      other => panic!("unexpected result: {other:?}"),
    }
    assert!(control.unwrap().wait().await.is_err());
  }

  #[tokio::test]
  async fn stop_terminates_a_stubborn_child() {
    let mut worker = RxWorker::start("test rx", &sh("trap '' TERM; sleep 30"), &[], |_| {}).unwrap();
    worker.stop(Duration::from_millis(200)).await;
    // After SIGKILL the wait resolves with a signal, not a code.
    match worker.wait().await {
      Err(WorkerError::ExitedNonZero { code: None, signal: Some(_), .. }) => {}
      Err(WorkerError::ExitedNonZero { .. }) => {}
      other => panic!("unexpected result: {other:?}"),
    }
  }
}
