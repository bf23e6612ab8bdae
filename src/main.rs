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

//! Serial Relay daemon

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use serial_relay::bluetooth::transport::RfcommTransport;
use serial_relay::config::Config;
use serial_relay::{SerialEvent, SerialService, ServiceOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("serial_relay=info".parse()?),
        )
        .init();

    info!("Starting Serial Relay v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Initialize Bluetooth
    let transport = Arc::new(RfcommTransport::new().await?);
    let (service, mut event_rx) =
        SerialService::new(transport, ServiceOptions::from_config(&config));

    if config.bluetooth.listen_on_start {
        service
            .start_listening(
                &config.bluetooth.service_name,
                config.bluetooth.service_uuid,
            )
            .await?;
    }

    // Start websocket bridge
    let bridge_task = if config.bridge.enabled {
        let bridge = service.bind_bridge(config.bridge.listen_addr).await?;
        Some(tokio::spawn(bridge.run()))
    } else {
        info!("Websocket bridge disabled");
        None
    };

    info!("Ready.");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => log_event(&event),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Some(task) = bridge_task {
        task.abort();
    }
    service.stop_listening().await;
    service.disconnect_all().await;

    info!("Serial Relay stopped");
    Ok(())
}

fn log_event(event: &SerialEvent) {
    match event {
        SerialEvent::ConnectionSuccess {
            address,
            message,
            incoming,
        } => {
            info!(
                "{} ({}): {}",
                address,
                if *incoming { "incoming" } else { "outgoing" },
                message
            );
        }
        SerialEvent::ConnectionFailed { address, message } => {
            warn!("{}: {}", address, message);
        }
        SerialEvent::ConnectionLost { address, message } => {
            warn!("{}: {}", address, message);
        }
        SerialEvent::Data { address, data } => {
            debug!("{}: received {} bytes", address, data.len());
        }
        SerialEvent::Error { message } => {
            error!("{}", message);
        }
    }
}
