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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, error, info};

use base::ident::AntennaId;
use base::link_flags;
use base::records::{RxAntennaMap, StatsRecord, TemperatureMap, TxLatencyMap};
use base::stats::{RxAntennaStats, RxPackets, Session, TxPackets};

use crate::encode_record;

/// Result of a registered callback. Failures are logged, never propagated: one misbehaving
/// subscriber must not break selection for the others.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Invoked with the newly selected NIC index whenever the TX antenna changes.
pub type AntSelCb = Box<dyn FnMut(usize) -> CallbackResult + Send>;

/// Invoked with `(rx_id, mav_rssi, rx_errors, rx_fec, flags)` after each RX update.
pub type RssiCb = Box<dyn FnMut(&str, u8, u16, u16, u32) -> CallbackResult + Send>;

/// TX antenna selection thresholds.
#[derive(Debug, Clone, Copy)]
pub struct SelectorTuning {
  /// Minimum RSSI improvement (dB) before switching away from a healthy antenna.
  pub rssi_delta: i32,
  /// Relative slack on the packet-counter threshold.
  pub counter_rel_delta: f64,
  /// Absolute slack on the packet-counter threshold.
  pub counter_abs_delta: u64,
}

impl Default for SelectorTuning {
  fn default() -> SelectorTuning {
    SelectorTuning { rssi_delta: 3, counter_rel_delta: 0.1, counter_abs_delta: 50 }
  }
}

/// Static configuration of one aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
  pub profile: String,
  pub wlans: Vec<String>,
  pub link_domain: String,
  pub version: String,
  pub tuning: SelectorTuning,
  /// Report instantaneous (true) or cumulative (false) error counters via RSSI injection.
  pub mavlink_err_rate: bool,
  pub debug: bool,
}

enum UiSession {
  /// An interactive CLI subscriber. Dropped wholesale when it cannot keep up.
  Subscriber(tokio::sync::mpsc::Sender<Bytes>),
  /// The binary log; a full buffer drops the frame, never the session.
  Logger(std::sync::mpsc::SyncSender<Bytes>),
}

struct Inner {
  cfg: AggregatorConfig,
  tx_sel: usize,
  ant_sel_cbs: Vec<AntSelCb>,
  rssi_cbs: Vec<RssiCb>,
  ui_sessions: Vec<UiSession>,
  rf_temperature: TemperatureMap,
}

/// Aggregates RX stats and selects the TX antenna.
///
/// All mutation happens under one lock; antenna-selection callbacks fire synchronously inside
/// the update that triggered them, before the record is broadcast, so subscribers observe the
/// post-switch `tx_ant`.
#[derive(Clone)]
pub struct Aggregator {
  inner: Arc<Mutex<Inner>>,
}

impl Aggregator {
  pub fn new(cfg: AggregatorConfig, logger: Option<std::sync::mpsc::SyncSender<Bytes>>) -> Aggregator {
    let mut ui_sessions = Vec::new();

    if let Some(logger) = logger {
      let init = StatsRecord::Init {
        timestamp: base::unix_now(),
        version: cfg.version.clone(),
        profile: cfg.profile.clone(),
        wlans: cfg.wlans.clone(),
        link_domain: cfg.link_domain.clone(),
      };
      if let Some(payload) = encode_record(&init) {
        let _ = logger.try_send(payload);
      }
      ui_sessions.push(UiSession::Logger(logger));
    }

    Aggregator {
      inner: Arc::new(Mutex::new(Inner {
        cfg,
        tx_sel: 0,
        ant_sel_cbs: Vec::new(),
        rssi_cbs: Vec::new(),
        ui_sessions,
        rf_temperature: TemperatureMap::new(),
      })),
    }
  }

  /// Title line sent as the first frame to every CLI subscriber.
  pub fn cli_title(&self) -> String {
    let inner = self.inner.lock().unwrap();
    format!(
      "wavelink_{} @{} {} [{}]",
      inner.cfg.version,
      inner.cfg.profile,
      inner.cfg.wlans.join(", "),
      inner.cfg.link_domain
    )
  }

  /// Register an antenna-selection callback. It is invoked immediately with the currently
  /// selected NIC so the caller can wire its initial peer.
  pub fn add_ant_sel_cb(&self, mut cb: AntSelCb) {
    let mut inner = self.inner.lock().unwrap();
    if let Err(err) = cb(inner.tx_sel) {
      error!(%err, "antenna selection callback failed");
    }
    inner.ant_sel_cbs.push(cb);
  }

  pub fn add_rssi_cb(&self, cb: RssiCb) {
    self.inner.lock().unwrap().rssi_cbs.push(cb);
  }

  /// Subscribe a CLI session to stat broadcasts. Deregistration is implicit: a closed or
  /// saturated channel removes the session on the next broadcast.
  pub fn add_session(&self, sender: tokio::sync::mpsc::Sender<Bytes>) {
    self.inner.lock().unwrap().ui_sessions.push(UiSession::Subscriber(sender));
  }

  /// Publish a fresh RF temperature map (single writer: the temperature probe).
  pub fn set_rf_temperature(&self, map: TemperatureMap) {
    self.inner.lock().unwrap().rf_temperature = map;
  }

  /// Currently selected TX NIC index.
  pub fn tx_sel(&self) -> usize {
    self.inner.lock().unwrap().tx_sel
  }

  /// The receiver announced a new session; recorded in the binary log only.
  pub fn process_new_session(&self, rx_id: &str, session: Session) {
    info!(
      rx_id,
      fec_type = ?session.fec_type,
      fec_k = session.fec_k,
      fec_n = session.fec_n,
      epoch = session.epoch,
      "new session detected"
    );
    let mut inner = self.inner.lock().unwrap();
    let record = StatsRecord::NewSession { timestamp: base::unix_now(), id: rx_id.to_string(), session };
    if let Some(payload) = encode_record(&record) {
      inner.broadcast_log_only(payload);
    }
  }

  /// Fold one RX window, run antenna selection and RSSI fan-out, then broadcast.
  pub fn update_rx_stats(
    &self,
    rx_id: &str,
    packets: RxPackets,
    ant_stats: RxAntennaMap,
    session: Option<Session>,
  ) {
    let mut inner = self.inner.lock().unwrap();
    let folded = fold_by_frequency(&ant_stats);
    let card_rssi: Vec<i32> = folded.values().map(|s| s.rssi_avg).collect();

    if !folded.is_empty() && !inner.ant_sel_cbs.is_empty() {
      inner.select_tx_antenna(&folded);
    }

    if !inner.rssi_cbs.is_empty() {
      let err_index = if inner.cfg.mavlink_err_rate { 0 } else { 1 };
      let pick = |c: (u64, u64)| if err_index == 0 { c.0 } else { c.1 };

      let mut flags = 0u32;
      if card_rssi.is_empty() {
        flags |= link_flags::LINK_LOST;
      } else if packets.dec_err.0 + packets.bad.0 > 0 {
        flags |= link_flags::LINK_JAMMED;
      }

      let rx_errors =
        (pick(packets.dec_err) + pick(packets.bad) + pick(packets.lost)).min(65535) as u16;
      let rx_fec = pick(packets.fec_rec).min(65535) as u16;
      let mav_rssi = card_rssi.iter().max().copied().unwrap_or(-128).rem_euclid(256) as u8;

      let mut cbs = std::mem::take(&mut inner.rssi_cbs);
      for cb in cbs.iter_mut() {
        if let Err(err) = cb(rx_id, mav_rssi, rx_errors, rx_fec, flags) {
          error!(%err, "rssi callback failed");
        }
      }
      inner.rssi_cbs = cbs;
    }

    if inner.cfg.debug {
      debug!(
        rx_id,
        rssi = ?card_rssi.iter().max(),
        tx_sel = inner.tx_sel,
        ?packets,
        "rx update"
      );
    }

    let record = StatsRecord::Rx {
      timestamp: base::unix_now(),
      id: rx_id.to_string(),
      tx_ant: inner.tx_sel as u8,
      packets,
      rx_ant_stats: ant_stats,
      session,
    };
    if let Some(payload) = encode_record(&record) {
      inner.broadcast(payload);
    }
  }

  /// Broadcast one TX window together with the current RF temperature map.
  pub fn update_tx_stats(&self, tx_id: &str, packets: TxPackets, latency: TxLatencyMap) {
    let mut inner = self.inner.lock().unwrap();
    if inner.cfg.debug {
      debug!(tx_id, ?packets, ?latency, "tx update");
    }
    let record = StatsRecord::Tx {
      timestamp: base::unix_now(),
      id: tx_id.to_string(),
      packets,
      latency,
      rf_temperature: inner.rf_temperature.clone(),
    };
    if let Some(payload) = encode_record(&record) {
      inner.broadcast(payload);
    }
  }
}

impl Inner {
  fn broadcast(&mut self, payload: Bytes) {
    self.ui_sessions.retain(|session| match session {
      UiSession::Subscriber(sender) => sender.try_send(payload.clone()).is_ok(),
      UiSession::Logger(sender) => {
        if sender.try_send(payload.clone()).is_err() {
          debug!("binary log buffer full, frame dropped");
        }
        true
      }
    });
  }

  fn broadcast_log_only(&mut self, payload: Bytes) {
    for session in &self.ui_sessions {
      if let UiSession::Logger(sender) = session {
        let _ = sender.try_send(payload.clone());
      }
    }
  }

  fn select_tx_antenna(&mut self, folded: &HashMap<AntennaId, RxAntennaStats>) {
    // Per NIC: best average RSSI and best packet counter over its antennas.
    let mut wlan_rssi_and_pkts: HashMap<usize, (i32, u64)> = HashMap::new();
    let mut max_pkts = 0u64;

    for (ant, stats) in folded {
      let idx = ant.wlan_idx() as usize;
      let entry = wlan_rssi_and_pkts.entry(idx).or_insert((i32::MIN, 0));
      entry.0 = entry.0.max(stats.rssi_avg);
      entry.1 = entry.1.max(stats.pkts);
      max_pkts = max_pkts.max(entry.1);
    }

    if wlan_rssi_and_pkts.is_empty() {
      return;
    }

    // Only NICs with near-maximum RX packet counters may transmit.
    let thr = max_pkts as f64
      - (self.cfg.tuning.counter_abs_delta as f64).max(max_pkts as f64 * self.cfg.tuning.counter_rel_delta);
    let candidates: Vec<usize> = wlan_rssi_and_pkts
      .iter()
      .filter(|(_, (_, pkts))| *pkts as f64 >= thr)
      .map(|(idx, _)| *idx)
      .collect();

    if candidates.is_empty() {
      return;
    }

    // Argmax over (rssi, idx); equal RSSI resolves to the higher NIC index.
    let (new_rssi, new_idx) = candidates
      .iter()
      .map(|&idx| (wlan_rssi_and_pkts[&idx].0, idx))
      .max()
      .unwrap_or((i32::MIN, 0));
    let cur_rssi = wlan_rssi_and_pkts.get(&self.tx_sel).map(|&(rssi, _)| rssi).unwrap_or(-1000);

    if new_idx == self.tx_sel {
      return;
    }

    if candidates.contains(&self.tx_sel) && new_rssi - cur_rssi < self.cfg.tuning.rssi_delta {
      // Current antenna already sees near-maximum packets and nothing else is
      // significantly louder.
      return;
    }

    info!(
      "Switch TX antenna #{} -> #{}, RSSI {} -> {}[dB]",
      self.tx_sel, new_idx, cur_rssi, new_rssi
    );

    let mut cbs = std::mem::take(&mut self.ant_sel_cbs);
    for cb in cbs.iter_mut() {
      if let Err(err) = cb(new_idx) {
        error!(%err, "antenna selection callback failed");
      }
    }
    self.ant_sel_cbs = cbs;

    self.tx_sel = new_idx;
  }
}

/// Fold per-`(freq, ant)` stats into per-antenna stats.
///
/// Averages are weighted by packet count and floored; min/max fields take the extreme over the
/// sources; packet counts sum. Antennas that contributed no packets are dropped.
pub fn fold_by_frequency(ant_stats: &RxAntennaMap) -> HashMap<AntennaId, RxAntennaStats> {
  struct Acc {
    pkts: u64,
    rssi_min: i32,
    rssi_sum: i64,
    rssi_max: i32,
    snr_min: i32,
    snr_sum: i64,
    snr_max: i32,
  }

  let mut acc: HashMap<AntennaId, Acc> = HashMap::new();
  for ((_freq, ant_id), s) in ant_stats {
    let entry = acc.entry(*ant_id).or_insert(Acc {
      pkts: 0,
      rssi_min: i32::MAX,
      rssi_sum: 0,
      rssi_max: i32::MIN,
      snr_min: i32::MAX,
      snr_sum: 0,
      snr_max: i32::MIN,
    });
    entry.pkts += s.pkts;
    entry.rssi_min = entry.rssi_min.min(s.rssi_min);
    entry.rssi_sum += s.rssi_avg as i64 * s.pkts as i64;
    entry.rssi_max = entry.rssi_max.max(s.rssi_max);
    entry.snr_min = entry.snr_min.min(s.snr_min);
    entry.snr_sum += s.snr_avg as i64 * s.pkts as i64;
    entry.snr_max = entry.snr_max.max(s.snr_max);
  }

  acc
    .into_iter()
    .filter(|(_, a)| a.pkts > 0)
    .map(|(ant_id, a)| {
      (
        ant_id,
        RxAntennaStats {
          pkts: a.pkts,
          rssi_min: a.rssi_min,
          rssi_avg: a.rssi_sum.div_euclid(a.pkts as i64) as i32,
          rssi_max: a.rssi_max,
          snr_min: a.snr_min,
          snr_avg: a.snr_sum.div_euclid(a.pkts as i64) as i32,
          snr_max: a.snr_max,
        },
      )
    })
    .collect()
}
