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

use base::records::TxLatencyMap;
use base::stats::TxPackets;

use crate::BadTelemetry;

/// An event produced by a parsed `wfb_tx` record.
#[derive(Debug, Clone, PartialEq)]
pub enum TxEvent {
  /// `LISTEN_UDP_END`: the worker finished announcing its per-NIC ephemeral input ports.
  PortsReady(HashMap<String, u16>),

  /// `LISTEN_UDP_CONTROL`: the worker bound its control port.
  ControlPort(u16),

  /// A `PKT` record closed the current reporting window.
  Update { packets: TxPackets, latency: TxLatencyMap },
}

/// Parser for `wfb_tx` stdout telemetry.
///
/// During startup the worker announces one `LISTEN_UDP` record per NIC, closed by
/// `LISTEN_UDP_END`; afterwards it reports `TX_ANT` latency windows closed by `PKT`.
#[derive(Debug, Default)]
pub struct TxParser {
  ports: HashMap<String, u16>,
  ant: TxLatencyMap,
  totals: Option<[u64; 7]>,
}

impl TxParser {
  pub fn new() -> TxParser {
    TxParser::default()
  }

  /// Parse one record. Lines with fewer than two fields are ignored: the TX worker may emit
  /// incidental output during startup.
  pub fn feed_line(&mut self, line: &str) -> Result<Option<TxEvent>, BadTelemetry> {
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() < 2 {
      return Ok(None);
    }

    match cols[1] {
      "LISTEN_UDP" if cols.len() == 3 => {
        let (port, wlan) = cols[2].split_once(':').ok_or_else(|| BadTelemetry::new(line))?;
        let port: u16 = port.parse().map_err(|_| BadTelemetry::new(line))?;
        self.ports.insert(wlan.to_string(), port);
        Ok(None)
      }

      "LISTEN_UDP_END" => Ok(Some(TxEvent::PortsReady(self.ports.clone()))),

      "LISTEN_UDP_CONTROL" if cols.len() == 3 => {
        let port: u16 = cols[2].parse().map_err(|_| BadTelemetry::new(line))?;
        Ok(Some(TxEvent::ControlPort(port)))
      }

      "TX_ANT" => {
        if cols.len() != 4 {
          return Err(BadTelemetry::new(line));
        }
        let ant = u64::from_str_radix(cols[2], 16).map_err(|_| BadTelemetry::new(line))?;
        let values: Option<Vec<i64>> = cols[3].split(':').map(|v| v.parse().ok()).collect();
        self.ant.insert(ant, values.ok_or_else(|| BadTelemetry::new(line))?);
        Ok(None)
      }

      "PKT" => {
        if cols.len() != 3 {
          return Err(BadTelemetry::new(line));
        }
        let v: Option<Vec<u64>> = cols[2].split(':').map(|x| x.parse().ok()).collect();
        let v = v.filter(|v| v.len() == 7).ok_or_else(|| BadTelemetry::new(line))?;
        let delta = [v[0], v[1], v[2], v[3], v[4], v[5], v[6]];

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

        let packets = TxPackets {
          fec_timeouts: (delta[0], totals[0]),
          incoming: (delta[1], totals[1]),
          incoming_bytes: (delta[2], totals[2]),
          injected: (delta[3], totals[3]),
          injected_bytes: (delta[4], totals[4]),
          dropped: (delta[5], totals[5]),
          truncated: (delta[6], totals[6]),
        };

        let latency = std::mem::take(&mut self.ant);
        Ok(Some(TxEvent::Update { packets, latency }))
      }

      _ => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn port_discovery_flow() {
    let mut parser = TxParser::new();
    assert_eq!(parser.feed_line("1\tLISTEN_UDP\t44321:wlan0").unwrap(), None);
    assert_eq!(parser.feed_line("1\tLISTEN_UDP\t44322:wlan1").unwrap(), None);

    match parser.feed_line("1\tLISTEN_UDP_END").unwrap().unwrap() {
      TxEvent::PortsReady(ports) => {
        assert_eq!(ports.get("wlan0"), Some(&44321));
        assert_eq!(ports.get("wlan1"), Some(&44322));
      }
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn control_port_announcement() {
    let mut parser = TxParser::new();
    match parser.feed_line("1\tLISTEN_UDP_CONTROL\t9100").unwrap().unwrap() {
      TxEvent::ControlPort(port) => assert_eq!(port, 9100),
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn latency_window_closes_on_pkt() {
    let mut parser = TxParser::new();
    assert_eq!(parser.feed_line("9\tTX_ANT\t7f00\t120:0:4:90").unwrap(), None);

    match parser.feed_line("9\tPKT\t0:100:15000:100:15200:0:0").unwrap().unwrap() {
      TxEvent::Update { packets, latency } => {
        assert_eq!(packets.incoming, (100, 100));
        assert_eq!(packets.injected_bytes, (15200, 15200));
        assert_eq!(latency.get(&0x7f00), Some(&vec![120, 0, 4, 90]));
      }
      other => panic!("unexpected event: {other:?}"),
    }

    match parser.feed_line("10\tPKT\t0:50:7500:50:7600:1:0").unwrap().unwrap() {
      TxEvent::Update { packets, latency } => {
        assert_eq!(packets.incoming, (50, 150));
        assert_eq!(packets.dropped, (1, 1));
        assert!(latency.is_empty());
      }
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn short_lines_are_ignored() {
    let mut parser = TxParser::new();
    assert_eq!(parser.feed_line("some incidental output").unwrap(), None);
  }

  #[test]
  fn malformed_records_are_rejected() {
    let mut parser = TxParser::new();
    assert!(parser.feed_line("1\tTX_ANT\t7f00").is_err());
    assert!(parser.feed_line("1\tPKT\t1:2:3").is_err());
    assert!(parser.feed_line("1\tLISTEN_UDP\tnot-a-port").is_err());
  }
}
