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

//! Host-facing operations on serial links.
//!
//! [`SerialService`] ties the registry, connector and listener together and
//! addresses every link by its peer address.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bluetooth::transport::DEFAULT_FALLBACK_CHANNEL;
use crate::bluetooth::{
    ConnectionConfirmer, ConnectionRegistry, Connector, Consumer, Link, LinkSettings, Listener,
    StaticConfirmer, Transport, DEFAULT_CHUNK_SIZE,
};
use crate::bridge::{codec, BridgeContext, WireBridge};
use crate::config::{Config, DEFAULT_SERVICE_UUID};
use crate::error::{Result, SerialError};
use crate::events::{EventSender, SerialEvent};

/// Construction options for [`SerialService`].
#[derive(Clone)]
pub struct ServiceOptions {
    pub service_uuid: Uuid,
    pub fallback_channel: u8,
    pub chunk_size: usize,
    pub delimiter: Vec<u8>,
    /// Asked before accepting an unpaired peer. `None` accepts everyone.
    pub confirmer: Option<Arc<dyn ConnectionConfirmer>>,
    /// Websocket server that accepted links are bridged to.
    pub incoming_bridge_url: Option<String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            fallback_channel: DEFAULT_FALLBACK_CHANNEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            delimiter: Vec::new(),
            confirmer: None,
            incoming_bridge_url: None,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        let confirmer: Option<Arc<dyn ConnectionConfirmer>> = if config.bluetooth.auto_accept {
            None
        } else {
            Some(Arc::new(StaticConfirmer::new(false)))
        };

        let incoming_bridge_url = if config.bridge.enabled {
            config.bridge.incoming_url.clone()
        } else {
            None
        };

        Self {
            service_uuid: config.bluetooth.service_uuid,
            fallback_channel: config.bluetooth.fallback_channel,
            chunk_size: config.link.read_chunk_size,
            delimiter: config.link.delimiter.as_bytes().to_vec(),
            confirmer,
            incoming_bridge_url,
        }
    }
}

impl std::fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("service_uuid", &self.service_uuid)
            .field("fallback_channel", &self.fallback_channel)
            .field("chunk_size", &self.chunk_size)
            .field("delimiter", &self.delimiter)
            .field("confirmer", &self.confirmer.is_some())
            .field("incoming_bridge_url", &self.incoming_bridge_url)
            .finish()
    }
}

/// Serial links to remote peers, addressed by peer address.
pub struct SerialService {
    registry: Arc<ConnectionRegistry>,
    connector: Arc<Connector>,
    listener: Listener,
    settings: LinkSettings,
}

impl SerialService {
    /// Create the service and the receiver for its events.
    ///
    /// Read tasks wait for room on the event channel, so the receiver must
    /// be drained or dropped. A host that only uses [`SerialService::read`]
    /// and friends should drop it, or every link stalls once the channel
    /// fills up.
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ServiceOptions,
    ) -> (Self, mpsc::Receiver<SerialEvent>) {
        let (events, event_rx) = EventSender::channel();
        let registry = Arc::new(ConnectionRegistry::new());
        let settings = LinkSettings::new(options.chunk_size, &options.delimiter);

        let connector = Arc::new(Connector::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            events.clone(),
            settings.clone(),
            options.service_uuid,
            options.fallback_channel,
        ));
        let listener = Listener::new(
            transport,
            Arc::clone(&registry),
            events,
            settings.clone(),
            options.confirmer,
            options.incoming_bridge_url,
        );

        let service = Self {
            registry,
            connector,
            listener,
            settings,
        };
        (service, event_rx)
    }

    /// Registered link to `address`, if it is still connected.
    fn link(&self, address: &str) -> Result<Arc<Link>> {
        self.registry
            .get(address)
            .filter(|link| link.is_connected())
            .ok_or_else(|| SerialError::not_connected(address))
    }

    /// Connect to `address` using the configured service.
    pub async fn connect(&self, address: &str) -> Result<Arc<Link>> {
        self.connector.connect(address).await
    }

    /// Connect to `address`, looking up `service_uuid` instead of the
    /// configured service.
    pub async fn connect_with_service(
        &self,
        address: &str,
        service_uuid: Uuid,
    ) -> Result<Arc<Link>> {
        self.connector
            .connect_with(address, service_uuid, Consumer::Buffer)
            .await
    }

    /// Close the link to `address`. Unknown addresses are ignored.
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let Some(link) = self.registry.get(address) else {
            debug!("Disconnect of {}: no link", address);
            return Ok(());
        };

        self.registry.remove(&link);
        link.close().await;
        info!("Disconnected {}", address);
        Ok(())
    }

    /// Close every link.
    pub async fn disconnect_all(&self) {
        let links = self.registry.drain();
        if !links.is_empty() {
            info!("Disconnecting {} link(s)", links.len());
        }
        for link in links {
            link.close().await;
        }
    }

    pub async fn write(&self, address: &str, data: &[u8]) -> Result<()> {
        self.link(address)?.write(data).await
    }

    /// Decode base64 `text` and write the bytes.
    pub async fn write_base64(&self, address: &str, text: &str) -> Result<()> {
        let data = codec::decode(text)?;
        self.write(address, &data).await
    }

    /// Number of buffered bytes.
    pub fn available(&self, address: &str) -> Result<usize> {
        Ok(self.link(address)?.available())
    }

    /// Take every buffered byte.
    pub fn read(&self, address: &str) -> Result<Vec<u8>> {
        Ok(self.link(address)?.read_all())
    }

    /// Take buffered bytes up to and including `delimiter`.
    ///
    /// Empty if the delimiter has not arrived yet.
    pub fn read_until(&self, address: &str, delimiter: &[u8]) -> Result<Vec<u8>> {
        Ok(self.link(address)?.read_until(delimiter))
    }

    pub fn clear(&self, address: &str) -> Result<()> {
        self.link(address)?.clear();
        Ok(())
    }

    /// Start accepting connections. Returns `false` if already listening.
    pub async fn start_listening(&self, service_name: &str, service_uuid: Uuid) -> Result<bool> {
        self.listener.start(service_name, service_uuid).await
    }

    /// Like [`SerialService::start_listening`], but treats a running
    /// listener as an error.
    pub async fn listen(&self, service_name: &str, service_uuid: Uuid) -> Result<()> {
        if self.start_listening(service_name, service_uuid).await? {
            Ok(())
        } else {
            Err(SerialError::AlreadyListening)
        }
    }

    pub async fn stop_listening(&self) -> bool {
        self.listener.stop().await
    }

    pub async fn is_listening(&self) -> bool {
        self.listener.is_listening().await
    }

    /// Set the framing delimiter for data events on new and live links.
    pub fn set_delimiter(&self, delimiter: &str) {
        let delimiter = delimiter.as_bytes();
        self.settings.set_delimiter(delimiter);
        for address in self.registry.addresses() {
            if let Some(link) = self.registry.get(&address) {
                link.set_delimiter(delimiter);
            }
        }
        debug!("Delimiter set to {:?}", String::from_utf8_lossy(delimiter));
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.link(address).is_ok()
    }

    /// Addresses with a registered link, sorted.
    pub fn connected_addresses(&self) -> Vec<String> {
        self.registry.addresses()
    }

    pub fn bridge_context(&self) -> BridgeContext {
        BridgeContext {
            registry: Arc::clone(&self.registry),
            connector: Arc::clone(&self.connector),
        }
    }

    /// Bind a websocket bridge sharing this service's links.
    pub async fn bind_bridge(&self, addr: SocketAddr) -> Result<WireBridge> {
        WireBridge::bind(addr, self.bridge_context()).await
    }
}
