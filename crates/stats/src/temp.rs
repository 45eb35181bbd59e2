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

use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use base::ident::AntennaId;
use base::records::TemperatureMap;

use crate::agg::Aggregator;

fn thermal_path(wlan: &str) -> PathBuf {
  PathBuf::from(format!("/proc/net/rtl88x2eu/{wlan}/thermal_state"))
}

/// Parse one driver thermal_state file.
///
/// Each non-empty line is `key:value,key:value,…` with decimal integer values; the required
/// keys are `rf_path` and `temperature`.
pub fn parse_thermal_state(wlan_idx: u8, text: &str) -> Result<Vec<(AntennaId, i32)>, String> {
  let mut out = Vec::new();
  for line in text.lines() {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let mut rf_path = None;
    let mut temperature = None;
    for field in line.split(',') {
      let (key, value) = field.split_once(':').ok_or_else(|| format!("malformed field: {field}"))?;
      let value: i32 = value.trim().parse().map_err(|_| format!("non-integer value: {field}"))?;
      match key.trim() {
        "rf_path" => rf_path = Some(value),
        "temperature" => temperature = Some(value),
        _ => {}
      }
    }

    let rf_path = rf_path.ok_or_else(|| format!("missing rf_path: {line}"))?;
    let temperature = temperature.ok_or_else(|| format!("missing temperature: {line}"))?;
    let rf_path = u8::try_from(rf_path).map_err(|_| format!("rf_path out of range: {line}"))?;
    out.push((AntennaId::new(wlan_idx, rf_path), temperature));
  }
  Ok(out)
}

fn read_temperatures(wlans: &[String]) -> TemperatureMap {
  let mut map = TemperatureMap::new();
  for (idx, wlan) in wlans.iter().enumerate() {
    let path = thermal_path(wlan);
    let text = match std::fs::read_to_string(&path) {
      Ok(text) => text,
      // Not all drivers expose a thermal node.
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
      Err(err) => {
        warn!(path = %path.display(), %err, "unable to read thermal state");
        continue;
      }
    };
    match parse_thermal_state(idx as u8, &text) {
      Ok(entries) => map.extend(entries),
      Err(err) => warn!(path = %path.display(), %err, "unable to parse thermal state"),
    }
  }
  map
}

/// Run the periodic temperature probe.
///
/// The first measurement happens immediately, then on a fixed period. File I/O runs on a
/// blocking worker thread; the resulting map is published to the aggregator wholesale.
pub fn spawn(wlans: Vec<String>, interval: Duration, agg: Aggregator) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let wlans = wlans.clone();
      match tokio::task::spawn_blocking(move || read_temperatures(&wlans)).await {
        Ok(map) => agg.set_rf_temperature(map),
        Err(err) => warn!(%err, "temperature probe worker failed"),
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_driver_lines() {
    let text = "rf_path:0,temperature:42\nrf_path:1,temperature:45\n";
    let entries = parse_thermal_state(1, text).unwrap();
    assert_eq!(entries, vec![(AntennaId::new(1, 0), 42), (AntennaId::new(1, 1), 45)]);
  }

  #[test]
  fn skips_blank_lines_and_extra_keys() {
    let text = "\nrf_path:0,vendor:7,temperature:39\n\n";
    let entries = parse_thermal_state(0, text).unwrap();
    assert_eq!(entries, vec![(AntennaId::new(0, 0), 39)]);
  }

  #[test]
  fn rejects_malformed_lines() {
    assert!(parse_thermal_state(0, "rf_path:0").is_err());
    assert!(parse_thermal_state(0, "rf_path:0,temperature:warm").is_err());
    assert!(parse_thermal_state(0, "temperature:42").is_err());
    assert!(parse_thermal_state(0, "garbage").is_err());
  }
}
