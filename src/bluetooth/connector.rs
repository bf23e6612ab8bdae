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

//! Outbound connection establishment.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::link::{Consumer, Link, LinkSettings};
use super::registry::ConnectionRegistry;
use super::transport::{BoxedStream, ConnectStrategy, Transport};
use crate::error::{Result, SerialError};
use crate::events::{EventSender, SerialEvent};

/// Opens outbound links and registers them.
pub struct Connector {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    events: EventSender,
    settings: LinkSettings,
    service_uuid: Uuid,
    fallback_channel: u8,
}

impl Connector {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConnectionRegistry>,
        events: EventSender,
        settings: LinkSettings,
        service_uuid: Uuid,
        fallback_channel: u8,
    ) -> Self {
        Self {
            transport,
            registry,
            events,
            settings,
            service_uuid,
            fallback_channel,
        }
    }

    /// Default service UUID used by [`Connector::connect`].
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// Strategies tried in order for a service.
    pub fn strategies(&self, service_uuid: Uuid) -> Vec<ConnectStrategy> {
        vec![
            ConnectStrategy::ServiceRecord(service_uuid),
            ConnectStrategy::Channel(self.fallback_channel),
        ]
    }

    /// Connect to `address` with the default service and buffer consumer.
    pub async fn connect(&self, address: &str) -> Result<Arc<Link>> {
        self.connect_with(address, self.service_uuid, Consumer::Buffer)
            .await
    }

    /// Connect to `address`, register the link and start its read task.
    pub async fn connect_with(
        &self,
        address: &str,
        service_uuid: Uuid,
        consumer: Consumer,
    ) -> Result<Arc<Link>> {
        let reservation = self.registry.reserve(address).map_err(|e| {
            warn!("Refusing connect to {}: {}", address, e);
            e
        })?;

        info!("Connecting to {}", address);
        let link = Link::outbound(address, &self.settings);

        let stream = match self.open(address, service_uuid).await {
            Ok(stream) => stream,
            Err(reason) => {
                link.close().await;
                warn!("Couldn't establish a connection to {}", address);
                self.events
                    .emit(SerialEvent::ConnectionFailed {
                        address: address.to_string(),
                        message: "Unable to connect to device".to_string(),
                    })
                    .await;
                return Err(SerialError::ConnectFailed {
                    address: address.to_string(),
                    reason,
                });
            }
        };

        link.establish(stream).await?;
        reservation.commit(Arc::clone(&link));

        self.events
            .emit(SerialEvent::ConnectionSuccess {
                address: address.to_string(),
                message: format!("Connected to {}", address),
                incoming: false,
            })
            .await;

        link.start(consumer, Arc::clone(&self.registry), self.events.clone())?;
        Ok(link)
    }

    async fn open(
        &self,
        address: &str,
        service_uuid: Uuid,
    ) -> std::result::Result<BoxedStream, String> {
        let mut last_error = String::from("no connect strategy");

        for (attempt, strategy) in self.strategies(service_uuid).into_iter().enumerate() {
            if attempt > 0 {
                info!("Trying fallback {} for {}", strategy, address);
            }

            match self.transport.connect(address, strategy).await {
                Ok(stream) => {
                    info!("Connected to {} via {}", address, strategy);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Connect to {} via {} failed: {}", address, strategy, e);
                    self.events.error(e.to_string()).await;
                    last_error = e.to_string();
                }
            }
        }

        Err(last_error)
    }
}
