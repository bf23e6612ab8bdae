// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Delimiter-aware receive buffer.

use tracing::trace;

/// Accumulates bytes read from a link until the owner consumes them.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty frame buffer.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Append bytes read from the stream.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        trace!("Buffered {} bytes, {} total", data.len(), self.buffer.len());
    }

    /// Number of buffered bytes.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take everything buffered so far.
    pub fn read_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Remove and return the bytes up to and including the first
    /// occurrence of `delimiter`.
    ///
    /// Returns an empty vector and leaves the buffer untouched when the
    /// delimiter is not present. An empty delimiter never matches.
    pub fn extract_until(&mut self, delimiter: &[u8]) -> Vec<u8> {
        match self.find(delimiter) {
            Some(index) => {
                let end = index + delimiter.len();
                let rest = self.buffer.split_off(end);
                std::mem::replace(&mut self.buffer, rest)
            }
            None => Vec::new(),
        }
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn find(&self, delimiter: &[u8]) -> Option<usize> {
        if delimiter.is_empty() || delimiter.len() > self.buffer.len() {
            return None;
        }
        self.buffer
            .windows(delimiter.len())
            .position(|window| window == delimiter)
    }
}
