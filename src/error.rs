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

//! Error types for link management and bridging.

use thiserror::Error;

/// Errors reported by the serial link layer.
#[derive(Debug, Error)]
pub enum SerialError {
    /// A link to this address is already registered or being established.
    #[error("Already connected to {address}")]
    AlreadyConnected {
        /// Remote peer address
        address: String,
    },

    /// An accept loop is already running.
    #[error("Already listening for incoming connections")]
    AlreadyListening,

    /// Every connect strategy failed.
    #[error("Unable to connect to {address}: {reason}")]
    ConnectFailed {
        /// Remote peer address
        address: String,
        /// Failure reason of the last strategy tried
        reason: String,
    },

    /// No link is registered for this address.
    #[error("Not connected to {address}")]
    NotConnected {
        /// Remote peer address
        address: String,
    },

    /// Read or write failure on an established link.
    #[error("Connection to {address} was lost: {reason}")]
    ConnectionLost {
        /// Remote peer address
        address: String,
        /// Failure reason
        reason: String,
    },

    /// Local websocket failure during relay.
    #[error("Bridge session error: {0}")]
    BridgeSession(String),

    /// A bridge frame was not valid base64.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Server socket or adapter failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl SerialError {
    pub fn not_connected(address: impl Into<String>) -> Self {
        Self::NotConnected {
            address: address.into(),
        }
    }

    pub fn already_connected(address: impl Into<String>) -> Self {
        Self::AlreadyConnected {
            address: address.into(),
        }
    }

    pub fn connection_lost(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionLost {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for the serial link layer.
pub type Result<T> = std::result::Result<T, SerialError>;
