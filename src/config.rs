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

//! Configuration module.
//!
//! Handles loading and saving relay settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::bluetooth::transport::DEFAULT_FALLBACK_CHANNEL;
use crate::bluetooth::DEFAULT_CHUNK_SIZE;

/// Service UUID advertised and dialled by default.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0xb0b2e90d_0cda_4bb0_8e4b_fb165cd17d48);

/// Default loopback port of the websocket bridge.
pub const DEFAULT_BRIDGE_PORT: u16 = 5666;

/// Default websocket server that inbound links are bridged to.
pub const DEFAULT_INCOMING_URL: &str = "ws://127.0.0.1:5667";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Link settings.
    pub link: LinkConfig,

    /// Websocket bridge settings.
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Service name registered by the listener.
    pub service_name: String,

    /// Service UUID for outbound lookups and the listener.
    pub service_uuid: Uuid,

    /// RFCOMM channel tried when service lookup fails.
    pub fallback_channel: u8,

    /// Start accepting connections at startup.
    pub listen_on_start: bool,

    /// Accept connections from unpaired devices without asking.
    pub auto_accept: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            service_name: "SerialRelay".to_string(),
            service_uuid: DEFAULT_SERVICE_UUID,
            fallback_channel: DEFAULT_FALLBACK_CHANNEL,
            listen_on_start: false,
            auto_accept: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bytes requested per stream read.
    pub read_chunk_size: usize,

    /// Frame delimiter for data events. Empty delivers raw chunks.
    pub delimiter: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            delimiter: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Run the websocket bridge.
    pub enabled: bool,

    /// Address the bridge server listens on.
    pub listen_addr: SocketAddr,

    /// Websocket server that accepted inbound links are bridged to.
    /// Unset keeps inbound links on the local buffer.
    pub incoming_url: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BRIDGE_PORT)),
            incoming_url: Some(DEFAULT_INCOMING_URL.to_string()),
        }
    }
}

impl Config {
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("serial-relay")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, writing defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
