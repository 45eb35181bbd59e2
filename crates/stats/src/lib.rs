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

//! Stat aggregation and distribution.
//!
//! One [`agg::Aggregator`] exists per profile. RX/TX telemetry updates flow in from the worker
//! supervisors; each RX update is folded by frequency, drives TX antenna selection and RSSI
//! fan-out, and is then broadcast in arrival order to every subscribed CLI session and to
//! the binary log.

use bytes::Bytes;

pub mod agg;
pub mod binlog;
pub mod server;
pub mod temp;

/// Defensive cap on a single stats frame (length prefix excluded).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encode one record as a MessagePack map, ready for length-prefixed framing.
///
/// Oversized frames are refused here so neither the TCP fan-out nor the binary log can emit a
/// frame a subscriber would reject.
pub fn encode_record(record: &base::records::StatsRecord) -> Option<Bytes> {
  match rmp_serde::to_vec_named(record) {
    Ok(payload) if payload.len() <= MAX_FRAME_LEN => Some(Bytes::from(payload)),
    Ok(payload) => {
      tracing::error!(len = payload.len(), "stats frame exceeds cap, dropped");
      None
    }
    Err(err) => {
      tracing::error!(%err, "stats frame encoding failed");
      None
    }
  }
}
