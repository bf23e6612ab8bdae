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

//! Websocket server accepting bridge sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use super::session::serve_session;
use crate::bluetooth::{ConnectionRegistry, Connector};
use crate::error::{Result, SerialError};

/// Shared state every bridge session needs.
#[derive(Clone)]
pub struct BridgeContext {
    pub registry: Arc<ConnectionRegistry>,
    pub connector: Arc<Connector>,
}

/// Loopback websocket server, one session per connection.
pub struct WireBridge {
    listener: TcpListener,
    context: BridgeContext,
}

impl WireBridge {
    /// Bind the bridge server.
    pub async fn bind(addr: SocketAddr, context: BridgeContext) -> Result<Self> {
        if !addr.ip().is_loopback() {
            warn!("Websocket bridge bound to non-loopback address {}", addr);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SerialError::Transport(format!("bridge bind {}: {}", addr, e)))?;

        Ok(Self { listener, context })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| SerialError::Transport(e.to_string()))
    }

    /// Accept bridge sessions until the task is dropped.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Websocket bridge started on {}", addr),
            Err(_) => info!("Websocket bridge started"),
        }

        loop {
            match self.listener.accept().await {
                Ok((tcp, peer)) => {
                    debug!("Bridge connection from {}", peer);
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        let ws = match tokio_tungstenite::accept_async(tcp).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                warn!("Websocket handshake with {} failed: {}", peer, e);
                                return;
                            }
                        };
                        if let Err(e) = serve_session(ws, context).await {
                            debug!("Bridge session from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Bridge accept error: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
