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

use base::ident::{AntennaId, FreqKey};
use base::records::RxAntennaMap;
use base::stats::{FecType, RxAntennaStats, RxPackets, Session};

use crate::BadTelemetry;

/// An event produced by a parsed `wfb_rx` record.
#[derive(Debug, Clone, PartialEq)]
pub enum RxEvent {
  /// A `PKT` record closed the current reporting window.
  Update { packets: RxPackets, ant_stats: RxAntennaMap, session: Option<Session> },

  /// The receiver announced a new session.
  NewSession(Session),
}

/// Parser for `wfb_rx` stdout telemetry.
///
/// `RX_ANT` records accumulate into a transient per-window antenna map; `PKT` closes the window
/// and publishes stats with both the window delta and the running total for every counter.
#[derive(Debug, Default)]
pub struct RxParser {
  ant: RxAntennaMap,
  totals: Option<[u64; 9]>,
  session: Option<Session>,
}

fn split_ints(field: &str) -> Option<Vec<i64>> {
  field.split(':').map(|v| v.parse::<i64>().ok()).collect()
}

fn split_uints(field: &str) -> Option<Vec<u64>> {
  field.split(':').map(|v| v.parse::<u64>().ok()).collect()
}

impl RxParser {
  pub fn new() -> RxParser {
    RxParser::default()
  }

  /// Parse one record; returns an event when a record closes a window or a session.
  pub fn feed_line(&mut self, line: &str) -> Result<Option<RxEvent>, BadTelemetry> {
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() < 2 {
      return Err(BadTelemetry::new(line));
    }

    // cols[0] is the worker timestamp, unused at this layer
    match cols[1] {
      "RX_ANT" => {
        if cols.len() != 5 {
          return Err(BadTelemetry::new(line));
        }
        let freq = split_uints(cols[2]).filter(|v| v.len() == 3).ok_or_else(|| BadTelemetry::new(line))?;
        let key = FreqKey {
          freq: u16::try_from(freq[0]).map_err(|_| BadTelemetry::new(line))?,
          mcs: u8::try_from(freq[1]).map_err(|_| BadTelemetry::new(line))?,
          bw: u8::try_from(freq[2]).map_err(|_| BadTelemetry::new(line))?,
        };
        let ant_id = u16::from_str_radix(cols[3], 16).map_err(|_| BadTelemetry::new(line))?;
        let v = split_ints(cols[4]).filter(|v| v.len() == 7).ok_or_else(|| BadTelemetry::new(line))?;
        let stats = RxAntennaStats {
          pkts: u64::try_from(v[0]).map_err(|_| BadTelemetry::new(line))?,
          rssi_min: v[1] as i32,
          rssi_avg: v[2] as i32,
          rssi_max: v[3] as i32,
          snr_min: v[4] as i32,
          snr_avg: v[5] as i32,
          snr_max: v[6] as i32,
        };
        self.ant.insert((key, AntennaId(ant_id)), stats);
        Ok(None)
      }

      "PKT" => {
        if cols.len() != 3 {
          return Err(BadTelemetry::new(line));
        }
        let v = split_uints(cols[2]).filter(|v| v.len() == 9).ok_or_else(|| BadTelemetry::new(line))?;
        // Wire order: all, all_bytes, dec_err, dec_ok, fec_rec, lost, bad, out, out_bytes.
        // Totals and published stats use dec_ok before dec_err.
        let delta = [v[0], v[1], v[3], v[4], v[5], v[2], v[6], v[7], v[8]];

        let totals = match self.totals.as_mut() {
          None => {
            self.totals = Some(delta);
            delta
          }
          Some(t) => {
            for (slot, d) in t.iter_mut().zip(delta) {
              *slot += d;
            }
            *t
          }
        };

        let packets = RxPackets {
          all: (delta[0], totals[0]),
          all_bytes: (delta[1], totals[1]),
          dec_ok: (delta[2], totals[2]),
          fec_rec: (delta[3], totals[3]),
          lost: (delta[4], totals[4]),
          dec_err: (delta[5], totals[5]),
          bad: (delta[6], totals[6]),
          out: (delta[7], totals[7]),
          out_bytes: (delta[8], totals[8]),
        };

        let ant_stats = std::mem::take(&mut self.ant);
        Ok(Some(RxEvent::Update { packets, ant_stats, session: self.session }))
      }

      "SESSION" => {
        if cols.len() != 3 {
          return Err(BadTelemetry::new(line));
        }
        let v = split_uints(cols[2]).filter(|v| v.len() == 4).ok_or_else(|| BadTelemetry::new(line))?;
        let session = Session {
          epoch: v[0],
          fec_type: FecType::from_code(v[1]),
          fec_k: u8::try_from(v[2]).map_err(|_| BadTelemetry::new(line))?,
          fec_n: u8::try_from(v[3]).map_err(|_| BadTelemetry::new(line))?,
        };
        self.session = Some(session);
        Ok(Some(RxEvent::NewSession(session)))
      }

      _ => Err(BadTelemetry::new(line)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn update(parser: &mut RxParser, line: &str) -> RxEvent {
    parser.feed_line(line).unwrap().unwrap()
  }

  #[test]
  fn window_accumulates_and_clears() {
    let mut parser = RxParser::new();
    assert!(parser.feed_line("100\tRX_ANT\t5805:1:20\t1\t10:-80:-70:-60:5:10:15").unwrap().is_none());
    assert!(parser.feed_line("100\tRX_ANT\t5805:1:20\t101\t20:-75:-65:-55:6:11:16").unwrap().is_none());

    match update(&mut parser, "101\tPKT\t30:4500:0:30:0:0:0:30:4500") {
      RxEvent::Update { ant_stats, packets, session } => {
        assert_eq!(ant_stats.len(), 2);
        assert_eq!(packets.all, (30, 30));
        assert_eq!(packets.out_bytes, (4500, 4500));
        assert!(session.is_none());
      }
      other => panic!("unexpected event: {other:?}"),
    }

    // Window cleared: next PKT reports no antennas.
    match update(&mut parser, "102\tPKT\t5:750:0:5:0:0:0:5:750") {
      RxEvent::Update { ant_stats, packets, .. } => {
        assert!(ant_stats.is_empty());
        assert_eq!(packets.all, (5, 35));
      }
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn pkt_wire_order_maps_dec_err_correctly() {
    let mut parser = RxParser::new();
    // all=9, all_bytes=1000, dec_err=7, dec_ok=2, fec_rec=3, lost=4, bad=5, out=6, out_bytes=500
    match update(&mut parser, "1\tPKT\t9:1000:7:2:3:4:5:6:500") {
      RxEvent::Update { packets, .. } => {
        assert_eq!(packets.dec_err, (7, 7));
        assert_eq!(packets.dec_ok, (2, 2));
        assert_eq!(packets.fec_rec, (3, 3));
        assert_eq!(packets.lost, (4, 4));
        assert_eq!(packets.bad, (5, 5));
      }
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn totals_are_monotonic() {
    let mut parser = RxParser::new();
    let mut prev = 0u64;
    for delta in [10u64, 0, 3, 7] {
      let line = format!("1\tPKT\t{delta}:0:0:0:0:0:0:0:0");
      match update(&mut parser, &line) {
        RxEvent::Update { packets, .. } => {
          assert_eq!(packets.all.0, delta);
          assert!(packets.all.1 >= prev);
          prev = packets.all.1;
        }
        other => panic!("unexpected event: {other:?}"),
      }
    }
    assert_eq!(prev, 20);
  }

  #[test]
  fn session_is_attached_to_subsequent_updates() {
    let mut parser = RxParser::new();
    match update(&mut parser, "1\tSESSION\t3:1:8:12") {
      RxEvent::NewSession(session) => {
        assert_eq!(session.epoch, 3);
        assert_eq!(session.fec_type, FecType::VdmRs);
        assert_eq!(session.fec_k, 8);
        assert_eq!(session.fec_n, 12);
      }
      other => panic!("unexpected event: {other:?}"),
    }
    match update(&mut parser, "2\tPKT\t1:100:0:1:0:0:0:1:100") {
      RxEvent::Update { session, .. } => assert_eq!(session.unwrap().epoch, 3),
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn bad_telemetry_is_reported_and_state_preserved() {
    let mut parser = RxParser::new();
    parser.feed_line("100\tRX_ANT\t5805:1:20\t1\t10:-80:-70:-60:5:10:15").unwrap();

    // Wrong arity, unknown command, non-integer field: all rejected.
    assert!(parser.feed_line("X\tPKT\t1:2:3").is_err());
    assert!(parser.feed_line("nonsense").is_err());
    assert!(parser.feed_line("1\tNOPE\tfoo").is_err());
    assert!(parser.feed_line("1\tPKT\t1:2:x:4:5:6:7:8:9").is_err());

    // Well-formed records continue to be processed against intact state.
    match update(&mut parser, "101\tPKT\t10:1500:0:10:0:0:0:10:1500") {
      RxEvent::Update { ant_stats, .. } => assert_eq!(ant_stats.len(), 1),
      other => panic!("unexpected event: {other:?}"),
    }
  }
}
