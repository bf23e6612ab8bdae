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

//! Bluetooth serial link management.
//!
//! Connector and listener establish links, the registry keeps at most one
//! link per peer address, and each link runs its own read task.

mod buffer;
mod confirm;
mod connector;
mod link;
mod listener;
mod registry;
pub mod transport;

pub use buffer::FrameBuffer;
pub use confirm::{
    ChannelConfirmer, ConfirmRequest, ConnectionConfirmer, PendingConfirmation, StaticConfirmer,
};
pub use connector::Connector;
pub use link::{
    Consumer, Direction, Link, LinkSettings, LinkState, DEFAULT_CHUNK_SIZE,
    RELAY_CHANNEL_CAPACITY,
};
pub use listener::Listener;
pub use registry::{ConnectionRegistry, Reservation};
pub use transport::{ConnectStrategy, Transport};
