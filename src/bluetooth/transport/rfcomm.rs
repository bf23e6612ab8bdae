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

//! Bluetooth RFCOMM transport backed by BlueZ.

use async_trait::async_trait;
use bluer::rfcomm::{ConnectRequest, Profile, ProfileHandle, Role, SocketAddr, Stream};
use bluer::{Adapter, Address, Session};
use futures::{Stream as FuturesStream, StreamExt};
use std::io;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BoxedStream, ConnectStrategy, Incoming, ServiceRecord, Transport, TransportListener};

fn io_error(err: bluer::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

fn parse_address(address: &str) -> io::Result<Address> {
    address.parse::<Address>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid Bluetooth address {}: {}", address, e),
        )
    })
}

/// Next request on `requests` made by `address`.
///
/// Requests from other devices belong to concurrent connects on the same
/// service and are dropped, which rejects them.
async fn next_request_from<S, R>(
    requests: &mut S,
    address: Address,
    device: impl Fn(&R) -> Address,
) -> Option<R>
where
    S: FuturesStream<Item = R> + Unpin,
{
    while let Some(request) = requests.next().await {
        if device(&request) == address {
            return Some(request);
        }
        debug!(
            "Ignoring profile connection from {} while waiting for {}",
            device(&request),
            address
        );
    }
    None
}

/// RFCOMM transport on the default adapter.
pub struct RfcommTransport {
    session: Session,
    adapter: Adapter,
}

impl RfcommTransport {
    /// Open a BlueZ session and power on the default adapter.
    pub async fn new() -> io::Result<Self> {
        info!("Initializing RFCOMM transport...");

        let session = Session::new().await.map_err(io_error)?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await.map_err(io_error)?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await.map_err(io_error)? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await.map_err(io_error)?;
        }

        Ok(Self { session, adapter })
    }

    async fn connect_service_record(&self, address: Address, uuid: Uuid) -> io::Result<Stream> {
        let profile = Profile {
            uuid,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = self.session.register_profile(profile).await.map_err(io_error)?;
        let device = self.adapter.device(address).map_err(io_error)?;

        // BlueZ hands the connected socket to the registered profile, so the
        // profile connect call and the incoming request race each other.
        let connect = device.connect_profile(&uuid);
        tokio::pin!(connect);
        let mut connect_done = false;

        let request = loop {
            tokio::select! {
                res = &mut connect, if !connect_done => {
                    res.map_err(io_error)?;
                    connect_done = true;
                }
                req = next_request_from(&mut handle, address, ConnectRequest::device) => {
                    break req.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::ConnectionAborted, "profile unregistered")
                    })?;
                }
            }
        };

        request.accept().map_err(io_error)
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    async fn connect(&self, address: &str, strategy: ConnectStrategy) -> io::Result<BoxedStream> {
        let target = parse_address(address)?;

        let stream = match strategy {
            ConnectStrategy::ServiceRecord(uuid) => {
                debug!("Connecting to {} by service record {}", address, uuid);
                self.connect_service_record(target, uuid).await?
            }
            ConnectStrategy::Channel(channel) => {
                debug!("Connecting to {} on RFCOMM channel {}", address, channel);
                Stream::connect(SocketAddr::new(target, channel)).await?
            }
        };

        Ok(Box::new(stream))
    }

    async fn listen(&self, service: &ServiceRecord) -> io::Result<Box<dyn TransportListener>> {
        let profile = Profile {
            uuid: service.uuid,
            name: Some(service.name.clone()),
            role: Some(Role::Server),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
        };
        let handle = self.session.register_profile(profile).await.map_err(io_error)?;
        info!(
            "RFCOMM service '{}' registered (UUID: {})",
            service.name, service.uuid
        );

        Ok(Box::new(RfcommListener {
            adapter: self.adapter.clone(),
            handle,
        }))
    }
}

/// Registered RFCOMM server profile.
///
/// Dropping it unregisters the profile from BlueZ.
pub struct RfcommListener {
    adapter: Adapter,
    handle: ProfileHandle,
}

#[async_trait]
impl TransportListener for RfcommListener {
    async fn accept(&mut self) -> io::Result<Incoming> {
        let request = self.handle.next().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "profile unregistered")
        })?;

        let address = request.device();
        let (trusted, name) = match self.adapter.device(address) {
            Ok(device) => (
                device.is_paired().await.unwrap_or(false),
                device.alias().await.ok(),
            ),
            Err(e) => {
                warn!("Could not look up device {}: {}", address, e);
                (false, None)
            }
        };

        let stream = request.accept().map_err(io_error)?;
        Ok(Incoming {
            address: address.to_string(),
            name,
            trusted,
            stream: Box::new(stream),
        })
    }
}
