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

//! In-memory transport built on `tokio::io::duplex`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BoxedStream, ConnectStrategy, Incoming, ServiceRecord, Transport, TransportListener};

const PIPE_CAPACITY: usize = 64 * 1024;

struct Peer {
    /// Peer only answers direct channel connects.
    legacy: bool,
    streams: mpsc::UnboundedSender<DuplexStream>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, Peer>,
    listener: Option<mpsc::UnboundedSender<Incoming>>,
    attempts: Vec<(String, ConnectStrategy)>,
    listen_calls: usize,
}

/// Transport whose peers live in the same process.
///
/// Each registered peer receives the far end of every stream opened
/// towards it.
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer that accepts every connect strategy.
    pub fn add_peer(&self, address: &str) -> mpsc::UnboundedReceiver<DuplexStream> {
        self.insert_peer(address, false)
    }

    /// Register a peer without a resolvable service record, so only
    /// channel connects succeed.
    pub fn add_legacy_peer(&self, address: &str) -> mpsc::UnboundedReceiver<DuplexStream> {
        self.insert_peer(address, true)
    }

    fn insert_peer(&self, address: &str, legacy: bool) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (streams, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .peers
            .insert(address.to_string(), Peer { legacy, streams });
        rx
    }

    /// Every connect attempt made so far, in order.
    pub fn attempts(&self) -> Vec<(String, ConnectStrategy)> {
        self.inner.lock().attempts.clone()
    }

    /// Number of server sockets opened.
    pub fn listen_calls(&self) -> usize {
        self.inner.lock().listen_calls
    }

    /// Simulate a remote peer connecting to the active listener.
    ///
    /// Returns the peer's end of the new stream.
    pub fn dial_in(
        &self,
        address: &str,
        name: Option<&str>,
        trusted: bool,
    ) -> io::Result<DuplexStream> {
        let inner = self.inner.lock();
        let listener = inner
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "not listening"))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let incoming = Incoming {
            address: address.to_string(),
            name: name.map(str::to_string),
            trusted,
            stream: Box::new(local),
        };
        listener
            .send(incoming)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;

        Ok(remote)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str, strategy: ConnectStrategy) -> io::Result<BoxedStream> {
        let mut inner = self.inner.lock();
        inner.attempts.push((address.to_string(), strategy));

        let peer = inner.peers.get(address).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("no peer at {}", address))
        })?;

        if peer.legacy && matches!(strategy, ConnectStrategy::ServiceRecord(_)) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "service discovery failed",
            ));
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        peer.streams
            .send(remote)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "peer gone"))?;

        debug!("Memory stream opened to {} via {}", address, strategy);
        Ok(Box::new(local))
    }

    async fn listen(&self, service: &ServiceRecord) -> io::Result<Box<dyn TransportListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.listener = Some(tx);
        inner.listen_calls += 1;

        debug!("Memory listener open for {} ({})", service.name, service.uuid);
        Ok(Box::new(MemoryListener { rx }))
    }
}

/// Server socket of a [`MemoryTransport`].
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&mut self) -> io::Result<Incoming> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed"))
    }
}
