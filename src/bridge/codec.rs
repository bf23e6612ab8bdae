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


//! Base64 text encoding of bridge frames.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{Result, SerialError};

/// Encode a raw chunk as a single-line base64 frame.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a frame, ignoring line breaks inserted by MIME-style encoders.
pub fn decode(frame: &str) -> Result<Vec<u8>> {
    let compact: String = frame.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SerialError::InvalidFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_payload() {
        let data: Vec<u8> = (0..=255).collect();
        let frame = encode(&data);

        assert!(!frame.contains('\n'));
        assert_eq!(decode(&frame).unwrap(), data);
    }

    #[test]
    fn test_wrapped_input() {
        // 76-column wrapping with a trailing newline
        let data = vec![0xA5u8; 120];
        let encoded = encode(&data);
        let wrapped = format!("{}\n{}\n", &encoded[..76], &encoded[76..]);

        assert_eq!(decode(&wrapped).unwrap(), data);
    }

    #[test]
    fn test_empty_frame() {
        assert_eq!(encode(b""), "");
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_frame() {
        assert!(matches!(decode("not base64!"), Err(SerialError::InvalidFrame(_))));
    }
}
