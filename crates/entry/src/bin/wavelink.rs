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
use std::process::exit;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use services::config::Settings;

/// Control-plane supervisor for the wavelink wireless bridge.
#[derive(Parser)]
#[command(name = "wavelink", version, about)]
struct Args {
  /// Configuration file.
  #[arg(long, default_value = "/etc/wavelink.toml")]
  config: PathBuf,

  /// Colon-separated profile list, e.g. `gs` or `gs:bind`.
  profiles: String,

  /// Wireless interfaces to drive in monitor mode.
  #[arg(required = true)]
  wlans: Vec<String>,
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let profiles: Vec<String> = args.profiles.split(':').map(str::to_string).collect();
  let wlans: Vec<String> =
    args.wlans.iter().flat_map(|arg| arg.split_whitespace()).map(str::to_string).collect();

  info!(
    "wavelink {} on {}/{}, profile(s) {} using {}",
    env!("CARGO_PKG_VERSION"),
    std::env::consts::OS,
    std::env::consts::ARCH,
    profiles.join(", "),
    wlans.join(", ")
  );
  info!("using config {}", args.config.display());

  let result = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .context("runtime startup failed")
    .and_then(|runtime| {
      runtime.block_on(async {
        let settings = Settings::load(&args.config)?;
        services::run(settings, profiles, wlans).await?;
        Ok(())
      })
    });

  match result {
    Ok(()) => {
      info!("exiting with code 0");
    }
    Err(err) => {
      error!("{err:#}");
      exit(1);
    }
  }
}
