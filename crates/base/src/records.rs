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

use serde::{Deserialize, Serialize};

use crate::ident::{AntennaId, FreqKey};
use crate::stats::{RxAntennaStats, RxPackets, Session, TxPackets};

/// Per-window RX antenna stats as reported, keyed by `((freq, mcs, bw), ant_id)`.
pub type RxAntennaMap = HashMap<(FreqKey, AntennaId), RxAntennaStats>;

/// Per-antenna TX latency tuples, keyed by the driver-reported antenna value.
pub type TxLatencyMap = HashMap<u64, Vec<i64>>;

/// RF module temperature in degrees C by antenna id.
pub type TemperatureMap = HashMap<AntennaId, i32>;

/// One record on the stats wire.
///
/// Encoded as a self-describing MessagePack map with a `type` discriminator; the same frames go
/// to interactive CLI subscribers and into the binary log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsRecord {
  /// Sent once per profile when the aggregator is created (to the binary log only).
  Init {
    timestamp: f64,
    version: String,
    profile: String,
    wlans: Vec<String>,
    link_domain: String,
  },

  /// First frame on every accepted CLI connection.
  CliTitle { cli_title: String },

  /// One RX telemetry window.
  Rx {
    timestamp: f64,
    id: String,
    tx_ant: u8,
    packets: RxPackets,
    rx_ant_stats: RxAntennaMap,
    session: Option<Session>,
  },

  /// One TX telemetry window.
  Tx {
    timestamp: f64,
    id: String,
    packets: TxPackets,
    latency: TxLatencyMap,
    rf_temperature: TemperatureMap,
  },

  /// The receiver announced a new session epoch.
  NewSession {
    timestamp: f64,
    id: String,
    #[serde(flatten)]
    session: Session,
  },

  /// A raw MAVLink frame captured by the message-logging hook.
  Mavlink { timestamp: f64, id: String, data: Vec<u8> },
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stats::FecType;

  fn roundtrip(record: &StatsRecord) {
    let bytes = rmp_serde::to_vec_named(record).unwrap();
    let back: StatsRecord = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(record, &back);
  }

  fn sample_session() -> Session {
    Session { epoch: 4, fec_type: FecType::VdmRs, fec_k: 8, fec_n: 12 }
  }

  #[test]
  fn init_roundtrips() {
    roundtrip(&StatsRecord::Init {
      timestamp: 1718000000.25,
      version: "0.4.0".to_string(),
      profile: "gs".to_string(),
      wlans: vec!["wlan0".to_string(), "wlan1".to_string()],
      link_domain: "default".to_string(),
    });
  }

  #[test]
  fn cli_title_roundtrips() {
    roundtrip(&StatsRecord::CliTitle { cli_title: "wavelink @gs".to_string() });
  }

  #[test]
  fn rx_roundtrips() {
    let mut rx_ant_stats = RxAntennaMap::new();
    rx_ant_stats.insert(
      (FreqKey { freq: 5805, mcs: 1, bw: 20 }, AntennaId::new(0, 1)),
      RxAntennaStats {
        pkts: 120,
        rssi_min: -77,
        rssi_avg: -64,
        rssi_max: -52,
        snr_min: 8,
        snr_avg: 17,
        snr_max: 25,
      },
    );
    let mut packets = RxPackets::default();
    packets.all = (120, 3600);
    packets.dec_ok = (118, 3590);
    roundtrip(&StatsRecord::Rx {
      timestamp: 1718000001.5,
      id: "video rx".to_string(),
      tx_ant: 1,
      packets,
      rx_ant_stats,
      session: Some(sample_session()),
    });
  }

  #[test]
  fn tx_roundtrips() {
    let mut latency = TxLatencyMap::new();
    latency.insert(0x7f00, vec![200, 0, 13, 450]);
    let mut rf_temperature = TemperatureMap::new();
    rf_temperature.insert(AntennaId::new(0, 0), 48);
    roundtrip(&StatsRecord::Tx {
      timestamp: 1718000002.0,
      id: "video tx".to_string(),
      packets: TxPackets::default(),
      latency,
      rf_temperature,
    });
  }

  #[test]
  fn mavlink_roundtrips() {
    roundtrip(&StatsRecord::Mavlink {
      timestamp: 1718000004.0,
      id: "mavlink rx".to_string(),
      data: vec![0xfe, 0x09, 0x00, 0x01, 0x01, 0x00],
    });
  }

  #[test]
  fn new_session_flattens_session_fields() {
    let record = StatsRecord::NewSession {
      timestamp: 1718000003.0,
      id: "video rx".to_string(),
      session: sample_session(),
    };
    roundtrip(&record);

    // The session fields sit at the top level of the record map, so the encoded
    // form must mention them by name.
    let bytes = rmp_serde::to_vec_named(&record).unwrap();
    let haystack = String::from_utf8_lossy(&bytes);
    for key in ["epoch", "fec_type", "fec_k", "fec_n"] {
      assert!(haystack.contains(key), "missing flattened key {key}");
    }
  }
}
