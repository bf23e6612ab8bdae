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

//! A single connection to a remote peer.
//!
//! A link owns its byte stream for its whole lifetime. Once connected, a
//! read task delivers every chunk to exactly one consumer: the link's own
//! frame buffer, or a bridge relay channel. The stream is closed once, by
//! whichever path first observes termination.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::buffer::FrameBuffer;
use super::registry::ConnectionRegistry;
use super::transport::BoxedStream;
use crate::error::{Result, SerialError};
use crate::events::{EventSender, SerialEvent};

/// Capacity of a bridge relay channel, in chunks.
pub const RELAY_CHANNEL_CAPACITY: usize = 32;

/// Default size of a single stream read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Who opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Lifecycle state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound transport connect in progress.
    Connecting,
    Connected,
    /// Close requested, read task still winding down.
    Closing,
    /// Terminal.
    Closed,
}

/// Destination of bytes read from the link.
#[derive(Debug)]
pub enum Consumer {
    /// Append to the link's frame buffer and emit data events.
    Buffer,
    /// Forward each chunk to a bridge session.
    Relay(mpsc::Sender<Vec<u8>>),
}

/// Per-link settings shared by everything that creates links.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub chunk_size: usize,
    delimiter: Arc<RwLock<Vec<u8>>>,
}

impl LinkSettings {
    pub fn new(chunk_size: usize, delimiter: &[u8]) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            delimiter: Arc::new(RwLock::new(delimiter.to_vec())),
        }
    }

    /// Delimiter copied into newly created links.
    pub fn delimiter(&self) -> Vec<u8> {
        self.delimiter.read().clone()
    }

    pub fn set_delimiter(&self, delimiter: &[u8]) {
        *self.delimiter.write() = delimiter.to_vec();
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, b"")
    }
}

struct Lifecycle {
    state: LinkState,
    read_task_started: bool,
}

/// One established (or establishing) connection to a peer.
pub struct Link {
    id: u64,
    address: String,
    direction: Direction,
    chunk_size: usize,
    lifecycle: Mutex<Lifecycle>,
    /// Failure that triggered a local close, reported as connection lost.
    lost_reason: Mutex<Option<String>>,
    delimiter: Mutex<Vec<u8>>,
    buffer: Mutex<FrameBuffer>,
    consumer: Mutex<Consumer>,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    shutdown: Notify,
}

impl Link {
    fn build(
        address: &str,
        direction: Direction,
        state: LinkState,
        stream: Option<BoxedStream>,
        settings: &LinkSettings,
    ) -> Arc<Self> {
        let (reader, writer) = match stream {
            Some(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                (Some(reader), Some(writer))
            }
            None => (None, None),
        };

        Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            address: address.to_string(),
            direction,
            chunk_size: settings.chunk_size,
            lifecycle: Mutex::new(Lifecycle {
                state,
                read_task_started: false,
            }),
            lost_reason: Mutex::new(None),
            delimiter: Mutex::new(settings.delimiter()),
            buffer: Mutex::new(FrameBuffer::new()),
            consumer: Mutex::new(Consumer::Buffer),
            reader: Mutex::new(reader),
            writer: AsyncMutex::new(writer),
            shutdown: Notify::new(),
        })
    }

    /// Create an outbound link in the connecting state.
    pub fn outbound(address: &str, settings: &LinkSettings) -> Arc<Self> {
        Self::build(address, Direction::Outbound, LinkState::Connecting, None, settings)
    }

    /// Create an inbound link around an accepted stream.
    pub fn inbound(address: &str, stream: BoxedStream, settings: &LinkSettings) -> Arc<Self> {
        Self::build(
            address,
            Direction::Inbound,
            LinkState::Connected,
            Some(stream),
            settings,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> LinkState {
        self.lifecycle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Hand the transport stream to a connecting link.
    ///
    /// Fails if the link was closed while the connect was outstanding; the
    /// stream is dropped in that case.
    pub async fn establish(&self, stream: BoxedStream) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let mut writer_slot = self.writer.lock().await;

        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != LinkState::Connecting {
            return Err(SerialError::not_connected(&self.address));
        }
        *writer_slot = Some(writer);
        *self.reader.lock() = Some(reader);
        lifecycle.state = LinkState::Connected;
        debug!("Link {} established", self.address);
        Ok(())
    }

    /// Start the read task with the given consumer.
    pub fn start(
        self: &Arc<Self>,
        consumer: Consumer,
        registry: Arc<ConnectionRegistry>,
        events: EventSender,
    ) -> Result<JoinHandle<()>> {
        let reader = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != LinkState::Connected || lifecycle.read_task_started {
                return Err(SerialError::not_connected(&self.address));
            }
            let reader = self
                .reader
                .lock()
                .take()
                .ok_or_else(|| SerialError::not_connected(&self.address))?;
            lifecycle.read_task_started = true;
            reader
        };
        *self.consumer.lock() = consumer;

        let link = Arc::clone(self);
        Ok(tokio::spawn(async move {
            link.read_loop(reader, registry, events).await;
        }))
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxedStream>,
        registry: Arc<ConnectionRegistry>,
        events: EventSender,
    ) {
        info!("Read task started for {}", self.address);
        let mut chunk = vec![0u8; self.chunk_size];

        let lost = loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("Read task for {} stopped locally", self.address);
                    break self.lost_reason.lock().take();
                }
                res = reader.read(&mut chunk) => match res {
                    Ok(0) => {
                        info!("Connection to {} closed by remote", self.address);
                        break Some("stream closed by remote".to_string());
                    }
                    Ok(n) => self.deliver(&chunk[..n], &events).await,
                    Err(e) => {
                        error!("Read error on {}: {}", self.address, e);
                        break Some(e.to_string());
                    }
                }
            }
        };

        drop(reader);
        self.release().await;
        registry.remove(&self);
        // Dropping the relay sender tells a bridge session the link is gone.
        *self.consumer.lock() = Consumer::Buffer;

        if let Some(reason) = lost {
            events
                .emit(SerialEvent::ConnectionLost {
                    address: self.address.clone(),
                    message: format!("Device connection to {} was lost: {}", self.address, reason),
                })
                .await;
        }
        info!("Read task finished for {}", self.address);
    }

    async fn deliver(&self, data: &[u8], events: &EventSender) {
        trace!("Read {} bytes from {}", data.len(), self.address);

        let relay = match &*self.consumer.lock() {
            Consumer::Relay(tx) => Some(tx.clone()),
            Consumer::Buffer => None,
        };
        if let Some(tx) = relay {
            if tx.send(data.to_vec()).await.is_ok() {
                return;
            }
            debug!("Relay for {} went away, buffering", self.address);
            self.release_relay(&tx);
        }

        let delimiter = self.delimiter.lock().clone();
        let frames = {
            let mut buffer = self.buffer.lock();
            buffer.append(data);
            if delimiter.is_empty() {
                vec![data.to_vec()]
            } else {
                let mut frames = Vec::new();
                loop {
                    let frame = buffer.extract_until(&delimiter);
                    if frame.is_empty() {
                        break;
                    }
                    frames.push(frame);
                }
                frames
            }
        };

        for frame in frames {
            events
                .emit(SerialEvent::Data {
                    address: self.address.clone(),
                    data: frame,
                })
                .await;
        }
    }

    /// Write bytes to the peer.
    ///
    /// A failed write closes the link and reports it as lost.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(SerialError::not_connected(&self.address));
        }

        let result = {
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| SerialError::not_connected(&self.address))?;
            match writer.write_all(data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                trace!("Wrote {} bytes to {}", data.len(), self.address);
                Ok(())
            }
            Err(e) => {
                warn!("Write to {} failed: {}", self.address, e);
                self.close_with(Some(e.to_string())).await;
                Err(SerialError::connection_lost(&self.address, e))
            }
        }
    }

    /// Close the link. Returns `false` if it was already closing or closed.
    pub async fn close(&self) -> bool {
        self.close_with(None).await
    }

    async fn close_with(&self, lost: Option<String>) -> bool {
        let read_task_running = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                LinkState::Closing | LinkState::Closed => return false,
                _ => lifecycle.state = LinkState::Closing,
            }
            lifecycle.read_task_started
        };
        info!("Closing link to {}", self.address);

        if read_task_running {
            *self.lost_reason.lock() = lost;
            self.shutdown.notify_one();
        } else {
            drop(self.reader.lock().take());
            self.release().await;
        }
        true
    }

    async fn release(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.address, e);
            }
        }
        self.lifecycle.lock().state = LinkState::Closed;
    }

    /// Route subsequent reads to a new relay channel.
    pub fn attach_relay(&self) -> Result<mpsc::Receiver<Vec<u8>>> {
        // The read task marks the link closed before it resets the consumer,
        // so the state must be checked while the consumer is held.
        let mut consumer = self.consumer.lock();
        if !self.is_connected() {
            return Err(SerialError::not_connected(&self.address));
        }

        if let Consumer::Relay(tx) = &*consumer {
            if !tx.is_closed() {
                return Err(SerialError::BridgeSession(format!(
                    "{} is already bridged",
                    self.address
                )));
            }
        }
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        *consumer = Consumer::Relay(tx);
        Ok(rx)
    }

    /// Route subsequent reads back to the frame buffer.
    pub fn detach_relay(&self) {
        *self.consumer.lock() = Consumer::Buffer;
    }

    fn release_relay(&self, stale: &mpsc::Sender<Vec<u8>>) {
        let mut consumer = self.consumer.lock();
        if let Consumer::Relay(tx) = &*consumer {
            if tx.same_channel(stale) {
                *consumer = Consumer::Buffer;
            }
        }
    }

    pub fn is_bridged(&self) -> bool {
        matches!(&*self.consumer.lock(), Consumer::Relay(tx) if !tx.is_closed())
    }

    pub fn set_delimiter(&self, delimiter: &[u8]) {
        *self.delimiter.lock() = delimiter.to_vec();
    }

    pub fn available(&self) -> usize {
        self.buffer.lock().available()
    }

    pub fn read_all(&self) -> Vec<u8> {
        self.buffer.lock().read_all()
    }

    pub fn read_until(&self, delimiter: &[u8]) -> Vec<u8> {
        self.buffer.lock().extract_until(delimiter)
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::Receiver;

    fn pipe() -> (BoxedStream, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(4096);
        (Box::new(local), remote)
    }

    fn started(
        settings: &LinkSettings,
    ) -> (
        Arc<Link>,
        tokio::io::DuplexStream,
        Arc<ConnectionRegistry>,
        Receiver<SerialEvent>,
    ) {
        let (stream, remote) = pipe();
        let link = Link::inbound("AA:BB", stream, settings);
        let registry = Arc::new(ConnectionRegistry::new());
        registry.insert(Arc::clone(&link)).unwrap();
        let (events, rx) = EventSender::channel();
        link.start(Consumer::Buffer, Arc::clone(&registry), events)
            .unwrap();
        (link, remote, registry, rx)
    }

    async fn next_event(rx: &mut Receiver<SerialEvent>) -> SerialEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_outbound_lifecycle() {
        let settings = LinkSettings::default();
        let link = Link::outbound("AA:BB", &settings);
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(link.direction(), Direction::Outbound);

        let (stream, _remote) = pipe();
        link.establish(stream).await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);

        assert!(link.close().await);
        assert_eq!(link.state(), LinkState::Closed);
        assert!(!link.close().await);
    }

    #[tokio::test]
    async fn test_establish_after_close_fails() {
        let link = Link::outbound("AA:BB", &LinkSettings::default());
        link.close().await;

        let (stream, _remote) = pipe();
        assert!(link.establish(stream).await.is_err());
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_reads_fill_buffer() {
        let (link, mut remote, _registry, mut rx) = started(&LinkSettings::default());

        remote.write_all(b"AB\nCD\n").await.unwrap();
        match next_event(&mut rx).await {
            SerialEvent::Data { address, data } => {
                assert_eq!(address, "AA:BB");
                assert_eq!(data, b"AB\nCD\n".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(link.available(), 6);
        assert_eq!(link.read_until(b"\n"), b"AB\n".to_vec());
        assert_eq!(link.read_until(b"\n"), b"CD\n".to_vec());
        assert_eq!(link.available(), 0);
    }

    #[tokio::test]
    async fn test_delimited_events_consume_frames() {
        let settings = LinkSettings::new(DEFAULT_CHUNK_SIZE, b"\n");
        let (link, mut remote, _registry, mut rx) = started(&settings);

        remote.write_all(b"one\ntw").await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SerialEvent::Data {
                address: "AA:BB".into(),
                data: b"one\n".to_vec()
            }
        );

        remote.write_all(b"o\n").await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SerialEvent::Data {
                address: "AA:BB".into(),
                data: b"two\n".to_vec()
            }
        );
        assert_eq!(link.available(), 0);
    }

    #[tokio::test]
    async fn test_remote_close_removes_from_registry() {
        let (link, remote, registry, mut rx) = started(&LinkSettings::default());
        drop(remote);

        match next_event(&mut rx).await {
            SerialEvent::ConnectionLost { address, .. } => assert_eq!(address, "AA:BB"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(registry.get("AA:BB").is_none());
        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_local_close_reaches_peer() {
        let (link, mut remote, registry, _rx) = started(&LinkSettings::default());

        assert!(link.close().await);
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.get("AA:BB").is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!link.close().await);
    }

    #[tokio::test]
    async fn test_attach_relay_to_closed_link() {
        let (link, _remote, _registry, _rx) = started(&LinkSettings::default());
        assert!(link.close().await);

        assert!(matches!(
            link.attach_relay(),
            Err(SerialError::NotConnected { .. })
        ));
        assert!(!link.is_bridged());
    }

    #[tokio::test]
    async fn test_attach_relay_after_remote_close() {
        let (link, remote, _registry, mut rx) = started(&LinkSettings::default());
        drop(remote);

        match next_event(&mut rx).await {
            SerialEvent::ConnectionLost { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            link.attach_relay(),
            Err(SerialError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_consumer_bypasses_buffer() {
        let (link, mut remote, _registry, _rx) = started(&LinkSettings::default());
        let mut relay = link.attach_relay().unwrap();
        assert!(link.is_bridged());
        assert!(link.attach_relay().is_err());

        remote.write_all(b"raw").await.unwrap();
        let chunk = tokio::time::timeout(Duration::from_secs(2), relay.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk, b"raw".to_vec());
        assert_eq!(link.available(), 0);

        link.detach_relay();
        assert!(!link.is_bridged());
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (link, mut remote, _registry, _rx) = started(&LinkSettings::default());
        link.write(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
