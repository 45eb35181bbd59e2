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
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ServiceError;

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
  #[serde(default)]
  pub common: Common,
  #[serde(default)]
  pub path: Paths,
  #[serde(default)]
  pub profiles: HashMap<String, Profile>,
}

impl Settings {
  pub fn load(path: &Path) -> Result<Settings, ServiceError> {
    let text = std::fs::read_to_string(path)
      .map_err(|err| ServiceError::Config(format!("cannot read {}: {err}", path.display())))?;
    toml::from_str(&text)
      .map_err(|err| ServiceError::Config(format!("cannot parse {}: {err}", path.display())))
  }
}

/// A channel number, either shared by all NICs or given per NIC.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Channel {
  Shared(u32),
  PerNic(HashMap<String, u32>),
}

impl Channel {
  pub fn for_wlan(&self, wlan: &str) -> Result<u32, ServiceError> {
    match self {
      Channel::Shared(ch) => Ok(*ch),
      Channel::PerNic(map) => map
        .get(wlan)
        .copied()
        .ok_or_else(|| ServiceError::Config(format!("no channel configured for {wlan}"))),
    }
  }
}

impl Default for Channel {
  fn default() -> Channel {
    Channel::Shared(161)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Common {
  /// Primary node initializes the NICs; secondary nodes assume it already happened.
  pub primary: bool,
  pub wifi_region: String,
  pub wifi_channel: Channel,
  /// Fixed TX power in mBm; zero leaves the driver default.
  pub wifi_txpower: u32,
  pub set_nm_unmanaged: bool,
  pub temp_measurement_interval: f64,
  pub tx_sel_rssi_delta: i32,
  pub tx_sel_counter_rel_delta: f64,
  pub tx_sel_counter_abs_delta: u64,
  /// Report instantaneous error counters in RADIO_STATUS instead of cumulative ones.
  pub mavlink_err_rate: bool,
  /// Seconds.
  pub mavlink_agg_timeout: f64,
  /// Seconds.
  pub tunnel_agg_timeout: f64,
  pub radio_mtu: usize,
  pub tx_rcv_buf_size: u64,
  /// Binary log name pattern; `%s` is replaced with the profile name. Empty disables.
  pub binary_log_file: String,
  /// Forced flush cadence of the binary log, seconds.
  pub binlog_flush_delay: f64,
  pub debug: bool,
}

impl Default for Common {
  fn default() -> Common {
    Common {
      primary: true,
      wifi_region: "BO".to_string(),
      wifi_channel: Channel::default(),
      wifi_txpower: 0,
      set_nm_unmanaged: true,
      temp_measurement_interval: 10.0,
      tx_sel_rssi_delta: 3,
      tx_sel_counter_rel_delta: 0.1,
      tx_sel_counter_abs_delta: 50,
      mavlink_err_rate: false,
      mavlink_agg_timeout: 0.5,
      tunnel_agg_timeout: 0.1,
      radio_mtu: 1445,
      tx_rcv_buf_size: 1_048_576,
      binary_log_file: String::new(),
      binlog_flush_delay: 10.0,
      debug: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Paths {
  pub bin_dir: PathBuf,
  pub conf_dir: PathBuf,
  pub log_dir: PathBuf,
}

impl Default for Paths {
  fn default() -> Paths {
    Paths {
      bin_dir: PathBuf::from("/usr/bin"),
      conf_dir: PathBuf::from("/etc"),
      log_dir: PathBuf::from("/var/log/wavelink"),
    }
  }
}

/// A named collection of services sharing NIC and link configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
  /// The SHA-1 prefix of this string forms the on-air link id.
  pub link_domain: String,
  /// Stats fan-out TCP port; zero disables the listener.
  #[serde(default)]
  pub stats_port: u16,
  #[serde(default)]
  pub streams: Vec<Stream>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
  UdpDirectRx,
  UdpDirectTx,
  Mavlink,
  Tunnel,
  UdpProxy,
}

/// One service in a profile. Every stream is a complete table; unset keys take the defaults
/// below.
#[derive(Debug, Clone, Deserialize)]
pub struct Stream {
  pub name: String,
  pub service_type: ServiceType,

  /// Peer address URI; not used by `tunnel` services.
  #[serde(default)]
  pub peer: String,
  pub keypair: String,

  #[serde(default)]
  pub stream_rx: Option<u32>,
  #[serde(default)]
  pub stream_tx: Option<u32>,

  #[serde(default = "defaults::frame_type")]
  pub frame_type: String,
  #[serde(default = "defaults::bandwidth")]
  pub bandwidth: u32,
  #[serde(default)]
  pub short_gi: bool,
  #[serde(default = "defaults::one")]
  pub stbc: u8,
  #[serde(default = "defaults::one")]
  pub ldpc: u8,
  #[serde(default = "defaults::mcs_index")]
  pub mcs_index: u8,
  #[serde(default = "defaults::fec_k")]
  pub fec_k: u8,
  #[serde(default = "defaults::fec_n")]
  pub fec_n: u8,
  /// Milliseconds.
  #[serde(default)]
  pub fec_timeout: u32,
  #[serde(default)]
  pub fec_delay: u32,
  /// Zero asks the TX worker for an ephemeral control port, reported back over telemetry.
  #[serde(default)]
  pub control_port: u16,
  #[serde(default)]
  pub force_vht: bool,
  #[serde(default)]
  pub use_qdisc: bool,
  #[serde(default)]
  pub fwmark: u32,
  /// Transmit identical frames on every NIC instead of only the selected one.
  #[serde(default)]
  pub mirror: bool,

  #[serde(default)]
  pub inject_rssi: bool,
  #[serde(default = "defaults::mavlink_sys_id")]
  pub mavlink_sys_id: u8,
  #[serde(default = "defaults::mavlink_comp_id")]
  pub mavlink_comp_id: u8,
  /// Zero disables the MAVLink TCP fan-out.
  #[serde(default)]
  pub mavlink_tcp_port: u16,
  #[serde(default)]
  pub log_messages: bool,
  #[serde(default)]
  pub call_on_arm: Option<String>,
  #[serde(default)]
  pub call_on_disarm: Option<String>,
  /// OSD mirror address (`connect://…`).
  #[serde(default)]
  pub osd: Option<String>,

  #[serde(default = "defaults::ifname")]
  pub ifname: String,
  #[serde(default = "defaults::ifaddr")]
  pub ifaddr: String,
  #[serde(default)]
  pub default_route: bool,
}

mod defaults {
  pub fn frame_type() -> String {
    "data".to_string()
  }
  pub fn bandwidth() -> u32 {
    20
  }
  pub fn one() -> u8 {
    1
  }
  pub fn mcs_index() -> u8 {
    2
  }
  pub fn fec_k() -> u8 {
    8
  }
  pub fn fec_n() -> u8 {
    12
  }
  pub fn mavlink_sys_id() -> u8 {
    3
  }
  pub fn mavlink_comp_id() -> u8 {
    68
  }
  pub fn ifname() -> String {
    "wl-tun".to_string()
  }
  pub fn ifaddr() -> String {
    "10.5.0.2/24".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
    [common]
    wifi_channel = 161
    binary_log_file = "wavelink-%s.bin"

    [path]
    bin_dir = "/opt/wavelink/bin"

    [profiles.gs]
    link_domain = "default"
    stats_port = 8003

    [[profiles.gs.streams]]
    name = "video"
    service_type = "udp_direct_rx"
    peer = "connect://127.0.0.1:5600"
    keypair = "gs.key"
    stream_rx = 0

    [[profiles.gs.streams]]
    name = "mavlink"
    service_type = "mavlink"
    peer = "serial:ttyS0:115200"
    keypair = "gs.key"
    stream_rx = 16
    stream_tx = 144
    inject_rssi = true
    bandwidth = 40
  "#;

  #[test]
  fn parses_sample_config() {
    let settings: Settings = toml::from_str(SAMPLE).unwrap();
    assert!(settings.common.primary);
    assert_eq!(settings.common.binary_log_file, "wavelink-%s.bin");
    assert_eq!(settings.path.bin_dir, PathBuf::from("/opt/wavelink/bin"));
    assert_eq!(settings.path.conf_dir, PathBuf::from("/etc"));

    let gs = &settings.profiles["gs"];
    assert_eq!(gs.stats_port, 8003);
    assert_eq!(gs.streams.len(), 2);

    let video = &gs.streams[0];
    assert_eq!(video.service_type, ServiceType::UdpDirectRx);
    assert_eq!(video.bandwidth, 20);
    assert_eq!(video.mcs_index, 2);

    let mavlink = &gs.streams[1];
    assert_eq!(mavlink.service_type, ServiceType::Mavlink);
    assert!(mavlink.inject_rssi);
    assert_eq!(mavlink.bandwidth, 40);
    assert_eq!(mavlink.mavlink_comp_id, 68);
  }

  #[test]
  fn per_nic_channels_parse() {
    let text = r#"
      [common]
      wifi_channel = { wlan0 = 161, wlan1 = 157 }
    "#;
    let settings: Settings = toml::from_str(text).unwrap();
    assert_eq!(settings.common.wifi_channel.for_wlan("wlan1").unwrap(), 157);
    assert!(settings.common.wifi_channel.for_wlan("wlan9").is_err());
  }
}
