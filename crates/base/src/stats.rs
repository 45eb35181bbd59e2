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

use serde::{Deserialize, Serialize};

/// A `(delta, total)` counter pair.
///
/// `delta` is the value reported in the current telemetry window; `total` is the running sum
/// over the life of the reporting worker and is monotonic.
pub type Counter = (u64, u64);

/// Cumulative RX packet counters, one `Counter` per telemetry field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxPackets {
  pub all: Counter,
  pub all_bytes: Counter,
  pub dec_ok: Counter,
  pub fec_rec: Counter,
  pub lost: Counter,
  pub dec_err: Counter,
  pub bad: Counter,
  pub out: Counter,
  pub out_bytes: Counter,
}

/// Cumulative TX packet counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPackets {
  pub fec_timeouts: Counter,
  pub incoming: Counter,
  pub incoming_bytes: Counter,
  pub injected: Counter,
  pub injected_bytes: Counter,
  pub dropped: Counter,
  pub truncated: Counter,
}

/// RF quality stats for one antenna over one reporting window.
///
/// RSSI and SNR are integer dBm/dB; the `avg` fields are arithmetic means over the window.
/// Serialized as the 7-tuple the workers report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AntTuple", into = "AntTuple")]
pub struct RxAntennaStats {
  pub pkts: u64,
  pub rssi_min: i32,
  pub rssi_avg: i32,
  pub rssi_max: i32,
  pub snr_min: i32,
  pub snr_avg: i32,
  pub snr_max: i32,
}

type AntTuple = (u64, i32, i32, i32, i32, i32, i32);

impl From<AntTuple> for RxAntennaStats {
  fn from((pkts, rssi_min, rssi_avg, rssi_max, snr_min, snr_avg, snr_max): AntTuple) -> Self {
    RxAntennaStats { pkts, rssi_min, rssi_avg, rssi_max, snr_min, snr_avg, snr_max }
  }
}

impl From<RxAntennaStats> for AntTuple {
  fn from(s: RxAntennaStats) -> AntTuple {
    (s.pkts, s.rssi_min, s.rssi_avg, s.rssi_max, s.snr_min, s.snr_avg, s.snr_max)
  }
}

/// FEC scheme advertised by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FecType {
  #[serde(rename = "VDM_RS")]
  VdmRs,
  Unknown,
}

impl FecType {
  /// Map the wire code reported in SESSION records.
  pub fn from_code(code: u64) -> FecType {
    match code {
      1 => FecType::VdmRs,
      _ => FecType::Unknown,
    }
  }
}

/// One receiver session; replaced whenever the receiver announces a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
  pub epoch: u64,
  pub fec_type: FecType,
  pub fec_k: u8,
  pub fec_n: u8,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ant_stats_serialize_as_tuple() {
    let stats = RxAntennaStats {
      pkts: 100,
      rssi_min: -70,
      rssi_avg: -60,
      rssi_max: -50,
      snr_min: 10,
      snr_avg: 20,
      snr_max: 30,
    };
    let bytes = rmp_serde::to_vec_named(&stats).unwrap();
    let back: RxAntennaStats = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(stats, back);
    // A 7-element msgpack array, not a map.
    assert_eq!(bytes[0], 0x97);
  }

  #[test]
  fn fec_type_codes() {
    assert_eq!(FecType::from_code(1), FecType::VdmRs);
    assert_eq!(FecType::from_code(0), FecType::Unknown);
    assert_eq!(FecType::from_code(42), FecType::Unknown);
  }
}
