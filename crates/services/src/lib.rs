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

//! Top-level orchestration.
//!
//! [`run`] initializes the NICs once, then brings up one aggregator (plus stats listener and
//! binary log) per profile and one service task per configured stream. Failures propagate with
//! first-error-wins semantics: the first failing service triggers shutdown of every sibling,
//! and its error becomes the process exit cause. SIGINT/SIGTERM funnel into the same path.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use stats::agg::{Aggregator, AggregatorConfig, SelectorTuning};
use stats::binlog::BinLog;
use stats::server::StatsServer;

pub mod builder;
pub mod config;
pub mod nic;

use builder::ServiceCtx;
use config::Settings;

#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("configuration error: {0}")]
  Config(String),

  #[error("nic init failed: {cmd}: {detail}")]
  NicInit { cmd: String, detail: String },

  #[error(transparent)]
  Worker(#[from] supervisor::WorkerError),

  #[error(transparent)]
  Proxy(#[from] proxy::ProxyError),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("service task failed: {0}")]
  Task(String),
}

/// Bring up every profile and run until all services finish, one fails, or a signal arrives.
pub async fn run(settings: Settings, profiles: Vec<String>, wlans: Vec<String>) -> Result<(), ServiceError> {
  let version = env!("CARGO_PKG_VERSION");

  let mut resolved = Vec::with_capacity(profiles.len());
  let mut max_bw = 0;
  for name in &profiles {
    let profile = settings
      .profiles
      .get(name)
      .ok_or_else(|| ServiceError::Config(format!("unknown profile: {name}")))?;
    for stream in &profile.streams {
      max_bw = max_bw.max(stream.bandwidth);
    }
    resolved.push((name.clone(), profile.clone()));
  }
  if max_bw == 0 {
    return Err(ServiceError::Config("no streams configured".to_string()));
  }

  nic::init_nics(&settings.common, &wlans, max_bw).await?;

  let common = Arc::new(settings.common.clone());
  let paths = Arc::new(settings.path.clone());
  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let mut services: JoinSet<Result<(), ServiceError>> = JoinSet::new();
  let mut aux_tasks = Vec::new();
  let mut binlogs = Vec::new();
  let mut aggregators = Vec::new();

  for (profile_name, profile) in resolved {
    let binlog = if common.binary_log_file.is_empty() {
      None
    } else {
      let base_name = common.binary_log_file.replace("%s", &profile_name);
      Some(BinLog::open(
        &base_name,
        &paths.log_dir,
        Duration::from_secs_f64(common.binlog_flush_delay),
      )?)
    };

    let agg = Aggregator::new(
      AggregatorConfig {
        profile: profile_name.clone(),
        wlans: wlans.clone(),
        link_domain: profile.link_domain.clone(),
        version: version.to_string(),
        tuning: SelectorTuning {
          rssi_delta: common.tx_sel_rssi_delta,
          counter_rel_delta: common.tx_sel_counter_rel_delta,
          counter_abs_delta: common.tx_sel_counter_abs_delta,
        },
        mavlink_err_rate: common.mavlink_err_rate,
        debug: common.debug,
      },
      binlog.as_ref().map(|log| log.sender()),
    );

    aux_tasks.push(stats::temp::spawn(
      wlans.clone(),
      Duration::from_secs_f64(common.temp_measurement_interval),
      agg.clone(),
    ));

    if profile.stats_port > 0 {
      let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, profile.stats_port));
      let server = StatsServer::bind(addr, agg.clone()).await?;
      aux_tasks.push(server.spawn());
    }

    let link_id = base::link_id_for_domain(&profile.link_domain);
    for stream in profile.streams {
      info!(
        "starting {profile_name}/{}@{} on {}",
        stream.name,
        profile.link_domain,
        wlans.join(", ")
      );
      let ctx = ServiceCtx {
        wlans: wlans.clone(),
        link_id,
        agg: agg.clone(),
        common: common.clone(),
        paths: paths.clone(),
        binlog: binlog.as_ref().map(|log| log.sender()),
        shutdown: shutdown_rx.clone(),
      };
      services.spawn(async move {
        let name = stream.name.clone();
        builder::run_service(&name, &stream, ctx).await.map_err(|err| {
          error!(service = %name, %err, "service failed");
          err
        })
      });
    }

    if let Some(log) = binlog {
      binlogs.push(log);
    }
    aggregators.push(agg);
  }

  let mut sigint = signal(SignalKind::interrupt())?;
  let mut sigterm = signal(SignalKind::terminate())?;

  let mut first_err: Option<ServiceError> = None;
  loop {
    tokio::select! {
      joined = services.join_next() => match joined {
        None => break,
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(err))) => {
          if first_err.is_none() {
            first_err = Some(err);
          }
          let _ = shutdown_tx.send(true);
        }
        Some(Err(join_err)) => {
          if first_err.is_none() {
            first_err = Some(ServiceError::Task(join_err.to_string()));
          }
          let _ = shutdown_tx.send(true);
        }
      },
      _ = sigint.recv() => {
        info!("received SIGINT, shutting down");
        let _ = shutdown_tx.send(true);
      },
      _ = sigterm.recv() => {
        info!("received SIGTERM, shutting down");
        let _ = shutdown_tx.send(true);
      },
    }
  }

  // Tear down in dependency order: background tasks, then aggregators (which hold the binary
  // log's sentinel subscription), then the logs themselves so their final frames are flushed.
  for task in aux_tasks {
    task.abort();
    let _ = task.await;
  }
  drop(aggregators);
  for log in binlogs {
    log.close();
  }

  match first_err {
    Some(err) => Err(err),
    None => Ok(()),
  }
}
