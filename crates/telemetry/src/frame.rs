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

/// Splits a child's stdout byte stream into `\n`-terminated records.
///
/// Bytes arrive in arbitrary chunks from the pipe; a record is surfaced only once its
/// terminator is seen. Surrounding whitespace (including a trailing `\r`) is trimmed.
#[derive(Debug, Default)]
pub struct LineFramer {
  buf: Vec<u8>,
}

impl LineFramer {
  pub fn new() -> LineFramer {
    LineFramer::default()
  }

  /// Feed a chunk, returning every record completed by it.
  pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    self.buf.extend_from_slice(chunk);

    while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
      let rest = self.buf.split_off(pos + 1);
      let line = std::mem::replace(&mut self.buf, rest);
      lines.push(String::from_utf8_lossy(&line[..pos]).trim().to_string());
    }
    lines
  }
}
