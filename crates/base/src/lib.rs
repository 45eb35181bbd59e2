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

#![forbid(unsafe_code)]

/// Antenna and frequency identifiers.
pub mod ident;

/// Peer address grammar (`connect://`, `listen://`, `serial:`).
pub mod peer;

/// Stat record types shared between the aggregator, the stats server and the binary log.
pub mod records;

/// Packet counters, per-antenna RF stats, and session descriptors.
pub mod stats;

use sha1::{Digest, Sha1};

/// Link flags carried in injected RADIO_STATUS telemetry.
pub mod link_flags {
  /// No RX antenna produced packets in the reporting window.
  pub const LINK_LOST: u32 = 1;

  /// Decode errors or corrupt frames were seen in the reporting window.
  pub const LINK_JAMMED: u32 = 2;
}

/// Derive the 24-bit on-air link id from a link domain name.
///
/// The id is the first three bytes of the SHA-1 of the domain, read big-endian. Both ends of a
/// link must agree on the domain string for their streams to associate.
pub fn link_id_for_domain(link_domain: &str) -> u32 {
  let digest = Sha1::digest(link_domain.as_bytes());
  ((digest[0] as u32) << 16) | ((digest[1] as u32) << 8) | (digest[2] as u32)
}

/// Current UNIX time as fractional seconds, as carried in stat records.
pub fn unix_now() -> f64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs_f64())
    .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn link_id_is_sha1_prefix() {
    // sha1("default") = 7505d64a54e061b7acd54ccd58b49dc43500b635
    assert_eq!(link_id_for_domain("default"), 0x7505d6);
  }

  #[test]
  fn link_id_fits_24_bits() {
    for domain in ["", "a", "openipc", "some-longer-domain-name"] {
      assert!(link_id_for_domain(domain) <= 0xff_ffff);
    }
  }
}
