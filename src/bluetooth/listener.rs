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

//! Accept loop for incoming connections.

use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::confirm::{ConfirmRequest, ConnectionConfirmer};
use super::link::{Consumer, Link, LinkSettings};
use super::registry::ConnectionRegistry;
use super::transport::{Incoming, ServiceRecord, Transport, TransportListener};
use crate::bridge;
use crate::error::{Result, SerialError};
use crate::events::{EventSender, SerialEvent};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Handles each accepted connection.
struct Acceptor {
    registry: Arc<ConnectionRegistry>,
    events: EventSender,
    settings: LinkSettings,
    confirmer: Option<Arc<dyn ConnectionConfirmer>>,
    /// Websocket URL that accepted links are bridged to.
    bridge_url: Option<String>,
}

impl Acceptor {
    async fn handle(&self, incoming: Incoming) {
        let Incoming {
            address,
            name,
            trusted,
            stream,
        } = incoming;

        if !trusted {
            if let Some(confirmer) = &self.confirmer {
                let request = ConfirmRequest {
                    address: address.clone(),
                    name: name.clone(),
                };
                if !confirmer.confirm(&request).await {
                    info!(
                        "Incoming connection from {} not accepted, closing socket",
                        address
                    );
                    return;
                }
                debug!("Accepted incoming connection from {}", address);
            }
        } else {
            debug!("Incoming connection from {} has a pre-existing bond", address);
        }

        let reservation = match self.registry.reserve(&address) {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!("Dropping incoming connection: {}", e);
                self.events.error(e.to_string()).await;
                return;
            }
        };

        let link = Link::inbound(&address, stream, &self.settings);
        reservation.commit(Arc::clone(&link));

        self.events
            .emit(SerialEvent::ConnectionSuccess {
                address: address.clone(),
                message: format!("Connected to {}", name.as_deref().unwrap_or(&address)),
                incoming: true,
            })
            .await;

        match &self.bridge_url {
            Some(url) => {
                bridge::bridge_incoming(
                    link,
                    url,
                    Arc::clone(&self.registry),
                    self.events.clone(),
                )
                .await;
            }
            None => {
                if let Err(e) =
                    link.start(Consumer::Buffer, Arc::clone(&self.registry), self.events.clone())
                {
                    warn!("Could not start read task for {}: {}", address, e);
                    self.registry.remove(&link);
                }
            }
        }
    }
}

struct AcceptLoop {
    service: ServiceRecord,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Listens for incoming connections on a single service.
pub struct Listener {
    transport: Arc<dyn Transport>,
    acceptor: Arc<Acceptor>,
    active: Mutex<Option<AcceptLoop>>,
}

impl Listener {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConnectionRegistry>,
        events: EventSender,
        settings: LinkSettings,
        confirmer: Option<Arc<dyn ConnectionConfirmer>>,
        bridge_url: Option<String>,
    ) -> Self {
        Self {
            transport,
            acceptor: Arc::new(Acceptor {
                registry,
                events,
                settings,
                confirmer,
                bridge_url,
            }),
            active: Mutex::new(None),
        }
    }

    /// Start accepting connections for a service.
    ///
    /// Returns `false` without opening a second server socket when an
    /// accept loop is already running.
    pub async fn start(&self, service_name: &str, service_uuid: Uuid) -> Result<bool> {
        let mut active = self.active.lock().await;
        if let Some(running) = active.as_ref() {
            debug!(
                "Already listening for incoming connections on '{}'",
                running.service.name
            );
            return Ok(false);
        }

        let service = ServiceRecord {
            name: service_name.to_string(),
            uuid: service_uuid,
        };
        let listener = self.transport.listen(&service).await.map_err(|e| {
            error!("Could not open server socket: {}", e);
            SerialError::Transport(e.to_string())
        })?;
        info!(
            "Listening for incoming connections on '{}' ({})",
            service.name, service.uuid
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let acceptor = Arc::clone(&self.acceptor);
        let task = tokio::spawn(async move {
            accept_loop(listener, shutdown_rx, acceptor).await;
        });

        *active = Some(AcceptLoop {
            service,
            shutdown_tx,
            task,
        });
        Ok(true)
    }

    /// Close the server socket. Returns `false` if nothing was listening.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.active.lock().await.take() else {
            return false;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        info!("Stopped listening on '{}'", running.service.name);
        true
    }

    pub async fn is_listening(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

async fn accept_loop(
    mut listener: Box<dyn TransportListener>,
    mut shutdown_rx: oneshot::Receiver<()>,
    acceptor: Arc<Acceptor>,
) {
    info!("Waiting for connections...");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            res = listener.accept() => match res {
                Ok(incoming) => {
                    info!("Connection from: {}", incoming.address);
                    let acceptor = Arc::clone(&acceptor);
                    tokio::spawn(async move {
                        acceptor.handle(incoming).await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    // Dropping the listener closes the server socket
    drop(listener);
    debug!("Accept loop finished");
}
