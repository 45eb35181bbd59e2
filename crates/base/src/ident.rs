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

/// Identifies one physical receive chain across the whole system.
///
/// Packed as `(wlan_idx << 8) | rf_path`: the high byte is the NIC ordinal assigned at startup,
/// the low byte the driver-reported RF path on that NIC. Collisions across NICs are impossible
/// by construction. Kept opaque on the wire; use the accessors internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AntennaId(pub u16);

impl AntennaId {
  pub fn new(wlan_idx: u8, rf_path: u8) -> AntennaId {
    AntennaId(((wlan_idx as u16) << 8) | rf_path as u16)
  }

  /// Ordinal of the owning NIC.
  pub fn wlan_idx(self) -> u8 {
    (self.0 >> 8) as u8
  }

  /// Driver-reported RF chain index on the owning NIC.
  pub fn rf_path(self) -> u8 {
    (self.0 & 0xff) as u8
  }
}

impl From<u16> for AntennaId {
  fn from(raw: u16) -> AntennaId {
    AntennaId(raw)
  }
}

/// Groups RX telemetry prior to folding; after folding stats are keyed by antenna alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(u16, u8, u8)", into = "(u16, u8, u8)")]
pub struct FreqKey {
  /// Center frequency in MHz.
  pub freq: u16,
  /// MCS index in use when the stats were captured.
  pub mcs: u8,
  /// Channel bandwidth in MHz.
  pub bw: u8,
}

impl From<(u16, u8, u8)> for FreqKey {
  fn from((freq, mcs, bw): (u16, u8, u8)) -> FreqKey {
    FreqKey { freq, mcs, bw }
  }
}

impl From<FreqKey> for (u16, u8, u8) {
  fn from(k: FreqKey) -> (u16, u8, u8) {
    (k.freq, k.mcs, k.bw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn antenna_id_packs_wlan_and_path() {
    let ant = AntennaId::new(2, 1);
    assert_eq!(ant.0, 0x0201);
    assert_eq!(ant.wlan_idx(), 2);
    assert_eq!(ant.rf_path(), 1);
  }

  #[test]
  fn antenna_id_roundtrips_raw() {
    let ant = AntennaId::from(0x0103u16);
    assert_eq!(ant, AntennaId::new(1, 3));
  }
}
