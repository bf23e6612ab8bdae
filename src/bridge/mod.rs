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

//! Loopback websocket bridge.
//!
//! Lets a second local process ride on a Bluetooth link. A session opens
//! with one text frame naming the peer address; every later frame in either
//! direction carries a base64-encoded chunk of the link's byte stream.

pub mod codec;
mod server;
mod session;

pub use server::{BridgeContext, WireBridge};
pub use session::{
    bridge_incoming, serve_session, CLOSE_CONFLICT, CLOSE_LOST_INCOMING, CLOSE_NOT_FOUND,
};
