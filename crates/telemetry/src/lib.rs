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

//! Typed parsers for worker telemetry.
//!
//! Workers emit ASCII records framed by `\n` with `\t`-separated fields: field 0 is a timestamp
//! (ignored here), field 1 the command. A malformed record yields [`BadTelemetry`]; the caller
//! logs it with the worker id and keeps feeding lines.

use thiserror::Error;

/// Byte-stream to line splitting.
pub mod frame;

/// `wfb_rx` telemetry records.
pub mod rx;

/// `wfb_tx` telemetry records, including ephemeral port discovery.
pub mod tx;

/// A telemetry record that could not be parsed. Never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad telemetry: {line}")]
pub struct BadTelemetry {
  /// The offending line, verbatim.
  pub line: String,
}

impl BadTelemetry {
  pub fn new(line: &str) -> BadTelemetry {
    BadTelemetry { line: line.to_string() }
  }
}
