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

use std::path::Path;
use std::time::Duration;

use tracing::{error, info};

use crate::config::Common;
use crate::ServiceError;

/// Translate the highest configured bandwidth to the driver HT-mode string.
pub fn ht_mode(max_bw: u32) -> Result<&'static str, ServiceError> {
  Ok(match max_bw {
    10 => "10MHz",
    20 => "HT20",
    40 => "HT40+",
    80 => "80MHz",
    160 => "160MHz",
    other => return Err(ServiceError::Config(format!("unsupported bandwidth {other} MHz"))),
  })
}

/// Run one external command; non-zero exit aborts with captured output.
async fn call_and_check(argv: &[&str], log_stdout: bool) -> Result<String, ServiceError> {
  let output = tokio::process::Command::new(argv[0])
    .args(&argv[1..])
    .output()
    .await
    .map_err(|err| ServiceError::NicInit { cmd: argv.join(" "), detail: err.to_string() })?;

  let stdout = String::from_utf8_lossy(&output.stdout).to_string();
  let stderr = String::from_utf8_lossy(&output.stderr).to_string();

  if !output.status.success() {
    if !stdout.is_empty() {
      error!("{stdout}");
    }
    if !stderr.is_empty() {
      error!("{stderr}");
    }
    return Err(ServiceError::NicInit {
      cmd: argv.join(" "),
      detail: format!("exit {:?}", output.status.code()),
    });
  }
  if log_stdout && !stdout.trim().is_empty() {
    info!("{}", stdout.trim());
  }
  Ok(stdout)
}

/// Put every NIC into monitor mode at the configured channel.
///
/// Idempotent: the same sequence applied to an already-configured card leaves it in the same
/// state. Secondary nodes skip the whole sequence.
pub async fn init_nics(common: &Common, wlans: &[String], max_bw: u32) -> Result<(), ServiceError> {
  let ht_mode = ht_mode(max_bw)?;

  if !common.primary {
    info!("skip card init due to secondary role");
    return Ok(());
  }

  call_and_check(&["iw", "reg", "set", &common.wifi_region], false).await?;

  for wlan in wlans {
    if common.set_nm_unmanaged && Path::new("/usr/bin/nmcli").exists() {
      let status = call_and_check(&["nmcli", "device", "show", wlan], false).await?;
      if !status.contains("(unmanaged)") {
        info!(wlan, "switching to unmanaged state");
        call_and_check(&["nmcli", "device", "set", wlan, "managed", "no"], false).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
      }
    }

    call_and_check(&["ip", "link", "set", wlan, "down"], false).await?;
    call_and_check(&["iw", "dev", wlan, "set", "monitor", "otherbss"], false).await?;
    call_and_check(&["ip", "link", "set", wlan, "up"], false).await?;

    let channel = common.wifi_channel.for_wlan(wlan)?.to_string();
    call_and_check(&["iw", "dev", wlan, "set", "channel", &channel, ht_mode], false).await?;

    if common.wifi_txpower > 0 {
      let mbm = common.wifi_txpower.to_string();
      call_and_check(&["iw", "dev", wlan, "set", "txpower", "fixed", &mbm], false).await?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ht_mode_mapping() {
    assert_eq!(ht_mode(10).unwrap(), "10MHz");
    assert_eq!(ht_mode(20).unwrap(), "HT20");
    assert_eq!(ht_mode(40).unwrap(), "HT40+");
    assert_eq!(ht_mode(80).unwrap(), "80MHz");
    assert_eq!(ht_mode(160).unwrap(), "160MHz");
    assert!(ht_mode(30).is_err());
  }

  #[tokio::test]
  async fn failing_command_captures_output() {
    match call_and_check(&["/bin/sh", "-c", "echo oops >&2; exit 2"], false).await {
      Err(ServiceError::NicInit { cmd, detail }) => {
        assert!(cmd.starts_with("/bin/sh"));
        assert!(detail.contains('2'));
      }
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn successful_command_returns_stdout() {
    let out = call_and_check(&["/bin/sh", "-c", "echo managed"], false).await.unwrap();
    assert_eq!(out.trim(), "managed");
  }
}
