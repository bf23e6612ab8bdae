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

//! Events reported to the owner of the serial service.

use tokio::sync::mpsc;
use tracing::trace;

/// Capacity of the owner notification channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications emitted by links, the connector and the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// A link reached the connected state.
    ConnectionSuccess {
        address: String,
        message: String,
        incoming: bool,
    },
    /// An outbound connect attempt failed.
    ConnectionFailed { address: String, message: String },
    /// An established link terminated on a read or write failure.
    ConnectionLost { address: String, message: String },
    /// Bytes received on a link using the buffer consumer.
    Data { address: String, data: Vec<u8> },
    /// Non-fatal error.
    Error { message: String },
}

/// Sending side of the notification channel.
///
/// Events sent after the owner dropped its receiver are discarded.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SerialEvent>,
}

impl EventSender {
    /// Create a notification channel.
    pub fn channel() -> (Self, mpsc::Receiver<SerialEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Emit an event, waiting while the channel is full.
    pub async fn emit(&self, event: SerialEvent) {
        if self.tx.send(event).await.is_err() {
            trace!("Event receiver dropped");
        }
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.emit(SerialEvent::Error {
            message: message.into(),
        })
        .await;
    }
}
