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

//! Byte-stream transport abstraction.
//!
//! Links only need a reliable duplex stream plus connect and accept
//! operations. The RFCOMM implementation talks to BlueZ; the in-memory
//! implementation backs tests and hosts that simulate peers.

mod memory;
#[cfg(feature = "bluetooth")]
mod rfcomm;

use async_trait::async_trait;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

pub use memory::{MemoryListener, MemoryTransport};
#[cfg(feature = "bluetooth")]
pub use rfcomm::{RfcommListener, RfcommTransport};

/// Standard Serial Port Profile UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// RFCOMM channel used when service lookup fails.
pub const DEFAULT_FALLBACK_CHANNEL: u8 = 1;

/// Duplex byte stream owned by a link.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn LinkStream>;

/// One way of opening an outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStrategy {
    /// Resolve the peer's service record by UUID.
    ServiceRecord(Uuid),
    /// Connect straight to a fixed RFCOMM channel.
    Channel(u8),
}

impl fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectStrategy::ServiceRecord(uuid) => write!(f, "service record {}", uuid),
            ConnectStrategy::Channel(channel) => write!(f, "channel {}", channel),
        }
    }
}

/// Service advertised by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub uuid: Uuid,
}

/// A connection accepted by a listener.
pub struct Incoming {
    pub address: String,
    pub name: Option<String>,
    /// Whether the peer is already paired with this adapter.
    pub trusted: bool,
    pub stream: BoxedStream,
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("trusted", &self.trusted)
            .finish_non_exhaustive()
    }
}

/// Opens outbound streams and server sockets.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a stream to `address` using a single strategy.
    async fn connect(&self, address: &str, strategy: ConnectStrategy) -> io::Result<BoxedStream>;

    /// Open a server socket advertising `service`.
    async fn listen(&self, service: &ServiceRecord) -> io::Result<Box<dyn TransportListener>>;
}

/// Server socket returned by [`Transport::listen`].
///
/// Dropping the listener closes the server socket.
#[async_trait]
pub trait TransportListener: Send {
    async fn accept(&mut self) -> io::Result<Incoming>;
}
