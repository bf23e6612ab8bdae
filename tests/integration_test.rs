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

//! Integration tests for links, the listener and the websocket bridge.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use serial_relay::bluetooth::transport::{
    BoxedStream, ConnectStrategy, Incoming, MemoryTransport, ServiceRecord, Transport,
    TransportListener,
};
use serial_relay::bridge::{codec, CLOSE_CONFLICT, CLOSE_LOST_INCOMING, CLOSE_NOT_FOUND};
use serial_relay::config::DEFAULT_SERVICE_UUID;
use serial_relay::{SerialError, SerialEvent, SerialService, ServiceOptions};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);

/// Stream whose writes fail while reads never complete.
struct DeadRadio;

impl AsyncRead for DeadRadio {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for DeadRadio {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "radio link dropped",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Transport whose every stream is a [`DeadRadio`].
///
/// Its listener yields one incoming connection from `inbound`, if set.
struct DeadRadioTransport {
    inbound: Option<String>,
}

struct DeadRadioListener {
    pending: Option<String>,
}

#[async_trait]
impl Transport for DeadRadioTransport {
    async fn connect(&self, _address: &str, _strategy: ConnectStrategy) -> io::Result<BoxedStream> {
        Ok(Box::new(DeadRadio))
    }

    async fn listen(&self, _service: &ServiceRecord) -> io::Result<Box<dyn TransportListener>> {
        Ok(Box::new(DeadRadioListener {
            pending: self.inbound.clone(),
        }))
    }
}

#[async_trait]
impl TransportListener for DeadRadioListener {
    async fn accept(&mut self) -> io::Result<Incoming> {
        match self.pending.take() {
            Some(address) => Ok(Incoming {
                address,
                name: None,
                trusted: true,
                stream: Box::new(DeadRadio),
            }),
            None => futures::future::pending().await,
        }
    }
}

fn service_on(
    transport: Arc<dyn Transport>,
    options: ServiceOptions,
) -> (Arc<SerialService>, mpsc::Receiver<SerialEvent>) {
    let (service, events) = SerialService::new(transport, options);
    (Arc::new(service), events)
}

fn service_with(
    transport: &Arc<MemoryTransport>,
    options: ServiceOptions,
) -> (Arc<SerialService>, mpsc::Receiver<SerialEvent>) {
    service_on(Arc::clone(transport) as Arc<dyn Transport>, options)
}

fn service(transport: &Arc<MemoryTransport>) -> (Arc<SerialService>, mpsc::Receiver<SerialEvent>) {
    service_with(transport, ServiceOptions::default())
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("timed out")
}

async fn start_bridge(service: &SerialService) -> SocketAddr {
    let bridge = service
        .bind_bridge("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = bridge.local_addr().unwrap();
    tokio::spawn(bridge.run());
    addr
}

async fn open_session(bridge: SocketAddr, address: &str) -> Client {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", bridge))
        .await
        .unwrap();
    ws.send(Message::Text(address.to_string())).await.unwrap();
    ws
}

/// Next data frame from the bridge, decoded.
async fn next_chunk(ws: &mut Client) -> Vec<u8> {
    loop {
        match within(ws.next()).await {
            Some(Ok(Message::Text(text))) => return codec::decode(&text).unwrap(),
            Some(Ok(Message::Close(frame))) => panic!("session closed: {:?}", frame),
            Some(Ok(_)) => continue,
            other => panic!("unexpected websocket item: {:?}", other),
        }
    }
}

/// Close code sent by the other side when it ends the session.
async fn close_code<S>(ws: &mut WebSocketStream<S>) -> (u16, String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match within(ws.next()).await {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.to_string())
            }
            Some(Ok(Message::Close(None))) | None => panic!("closed without a close frame"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("websocket error: {}", e),
        }
    }
}

async fn read_exact(remote: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    within(remote.read_exact(&mut data)).await.unwrap();
    data
}

#[tokio::test]
async fn test_read_until_scenario() {
    let transport = Arc::new(MemoryTransport::new());
    let mut peer = transport.add_peer("AA:BB");
    let (service, _events) = service(&transport);

    service.connect("AA:BB").await.unwrap();
    let mut remote = peer.recv().await.unwrap();
    remote.write_all(b"AB\nCD\n").await.unwrap();

    wait_for(|| service.available("AA:BB").unwrap() == 6).await;
    assert_eq!(service.read_until("AA:BB", b"\n").unwrap(), b"AB\n");
    assert_eq!(service.read("AA:BB").unwrap(), b"CD\n");
    assert_eq!(service.available("AA:BB").unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_connect_registers_one_link() {
    let transport = Arc::new(MemoryTransport::new());
    let _peer = transport.add_peer("AA:BB");
    let (service, _events) = service(&transport);

    let (first, second) = tokio::join!(service.connect("AA:BB"), service.connect("AA:BB"));

    let rejected = [&first, &second]
        .iter()
        .filter(|res| matches!(res, Err(SerialError::AlreadyConnected { .. })))
        .count();
    assert_eq!(rejected, 1);
    assert!(first.is_ok() || second.is_ok());
    assert_eq!(service.connected_addresses(), vec!["AA:BB"]);
}

#[tokio::test]
async fn test_fallback_to_channel() {
    let transport = Arc::new(MemoryTransport::new());
    let mut peer = transport.add_legacy_peer("AA:BB");
    let (service, _events) = service(&transport);

    service.connect("AA:BB").await.unwrap();
    assert!(peer.recv().await.is_some());
    assert_eq!(transport.attempts().len(), 2);
}

#[tokio::test]
async fn test_remote_close_reports_not_connected() {
    let transport = Arc::new(MemoryTransport::new());
    let mut peer = transport.add_peer("AA:BB");
    let (service, mut events) = service(&transport);

    service.connect("AA:BB").await.unwrap();
    let remote = peer.recv().await.unwrap();
    drop(remote);

    wait_for(|| !service.is_connected("AA:BB")).await;
    assert!(matches!(
        service.available("AA:BB"),
        Err(SerialError::NotConnected { .. })
    ));
    assert!(matches!(
        service.write("AA:BB", b"x").await,
        Err(SerialError::NotConnected { .. })
    ));

    let lost = within(async {
        loop {
            match events.recv().await {
                Some(SerialEvent::ConnectionLost { address, .. }) => break address,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await;
    assert_eq!(lost, "AA:BB");

    // A fresh connect works after the loss
    let _remote = {
        service.connect("AA:BB").await.unwrap();
        peer.recv().await.unwrap()
    };
    assert!(service.is_connected("AA:BB"));
}

#[tokio::test]
async fn test_start_listening_twice() {
    let transport = Arc::new(MemoryTransport::new());
    let (service, _events) = service(&transport);

    assert!(service
        .start_listening("Serial", DEFAULT_SERVICE_UUID)
        .await
        .unwrap());
    assert!(!service
        .start_listening("Serial", DEFAULT_SERVICE_UUID)
        .await
        .unwrap());
    assert_eq!(transport.listen_calls(), 1);

    service.stop_listening().await;
    assert!(service
        .start_listening("Serial", DEFAULT_SERVICE_UUID)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_incoming_link_buffered() {
    let transport = Arc::new(MemoryTransport::new());
    let (service, mut events) = service(&transport);
    service
        .start_listening("Serial", DEFAULT_SERVICE_UUID)
        .await
        .unwrap();

    let mut remote = transport.dial_in("AA:BB", Some("Phone"), true).unwrap();
    match within(events.recv()).await {
        Some(SerialEvent::ConnectionSuccess {
            address, incoming, ..
        }) => {
            assert_eq!(address, "AA:BB");
            assert!(incoming);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    remote.write_all(b"hello").await.unwrap();
    wait_for(|| service.available("AA:BB").unwrap_or(0) == 5).await;

    service.write("AA:BB", b"back").await.unwrap();
    assert_eq!(read_exact(&mut remote, 4).await, b"back");
}

#[tokio::test]
async fn test_bridge_session_owns_new_link() {
    let transport = Arc::new(MemoryTransport::new());
    let mut peer = transport.add_peer("AA:BB");
    let (service, _events) = service(&transport);
    let bridge = start_bridge(&service).await;

    let mut ws = open_session(bridge, "AA:BB").await;
    let mut remote = within(peer.recv()).await.unwrap();
    wait_for(|| service.is_connected("AA:BB")).await;

    remote.write_all(b"hi").await.unwrap();
    assert_eq!(next_chunk(&mut ws).await, b"hi");

    ws.send(Message::Text(codec::encode(b"yo"))).await.unwrap();
    assert_eq!(read_exact(&mut remote, 2).await, b"yo");

    // Binary frames carry the same text encoding
    ws.send(Message::Binary(codec::encode(b"!").into_bytes()))
        .await
        .unwrap();
    assert_eq!(read_exact(&mut remote, 1).await, b"!");

    ws.close(None).await.unwrap();
    wait_for(|| !service.is_connected("AA:BB")).await;

    // The peer sees the stream end
    let mut rest = Vec::new();
    within(remote.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_bridge_session_borrows_existing_link() {
    let transport = Arc::new(MemoryTransport::new());
    let mut peer = transport.add_peer("AA:BB");
    let (service, _events) = service(&transport);
    let bridge = start_bridge(&service).await;

    let link = service.connect("AA:BB").await.unwrap();
    let mut remote = peer.recv().await.unwrap();

    let mut ws = open_session(bridge, "AA:BB").await;
    ws.send(Message::Text(codec::encode(b"ping"))).await.unwrap();
    assert_eq!(read_exact(&mut remote, 4).await, b"ping");
    assert!(link.is_bridged());

    remote.write_all(b"pong").await.unwrap();
    assert_eq!(next_chunk(&mut ws).await, b"pong");

    // Only one session per link
    let mut second = open_session(bridge, "AA:BB").await;
    assert_eq!(close_code(&mut second).await.0, CLOSE_CONFLICT);

    ws.close(None).await.unwrap();
    wait_for(|| !link.is_bridged()).await;
    assert!(service.is_connected("AA:BB"));

    remote.write_all(b"buffered").await.unwrap();
    wait_for(|| service.available("AA:BB").unwrap_or(0) == 8).await;
}

#[tokio::test]
async fn test_bridge_connect_failure_closes_session() {
    let transport = Arc::new(MemoryTransport::new());
    let (service, _events) = service(&transport);
    let bridge = start_bridge(&service).await;

    let mut ws = open_session(bridge, "CC:DD").await;
    let (code, reason) = close_code(&mut ws).await;
    assert_eq!(code, CLOSE_NOT_FOUND);
    assert_eq!(reason, "Could not connect to bluetooth device CC:DD");
    assert!(service.connected_addresses().is_empty());
}

#[tokio::test]
async fn test_incoming_link_bridged_to_local_server() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());

    let transport = Arc::new(MemoryTransport::new());
    let options = ServiceOptions {
        incoming_bridge_url: Some(url),
        ..ServiceOptions::default()
    };
    let (service, _events) = service_with(&transport, options);
    service
        .start_listening("Serial", DEFAULT_SERVICE_UUID)
        .await
        .unwrap();

    let mut remote = transport.dial_in("AA:BB", None, true).unwrap();
    let (tcp, _) = within(server.accept()).await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    remote.write_all(b"from device").await.unwrap();
    match within(ws.next()).await {
        Some(Ok(Message::Text(text))) => {
            assert_eq!(codec::decode(&text).unwrap(), b"from device")
        }
        other => panic!("unexpected websocket item: {:?}", other),
    }

    ws.send(Message::Text(codec::encode(b"to device")))
        .await
        .unwrap();
    assert_eq!(read_exact(&mut remote, 9).await, b"to device");

    ws.close(None).await.unwrap();
    wait_for(|| !service.is_connected("AA:BB")).await;
}

#[tokio::test]
async fn test_peer_eof_closes_bridge_session() {
    let transport = Arc::new(MemoryTransport::new());
    let mut peer = transport.add_peer("AA:BB");
    let (service, _events) = service(&transport);
    let bridge = start_bridge(&service).await;

    let mut ws = open_session(bridge, "AA:BB").await;
    let remote = within(peer.recv()).await.unwrap();
    wait_for(|| service.is_connected("AA:BB")).await;

    drop(remote);
    let (code, reason) = close_code(&mut ws).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "Connection to AA:BB closed");
    wait_for(|| service.connected_addresses().is_empty()).await;
}

#[tokio::test]
async fn test_bridge_write_failure_closes_session() {
    let transport = Arc::new(DeadRadioTransport { inbound: None });
    let (service, _events) = service_on(transport, ServiceOptions::default());
    let bridge = start_bridge(&service).await;

    let mut ws = open_session(bridge, "AA:BB").await;
    wait_for(|| service.is_connected("AA:BB")).await;

    ws.send(Message::Text(codec::encode(b"lost"))).await.unwrap();
    let (code, reason) = close_code(&mut ws).await;
    assert_eq!(code, CLOSE_NOT_FOUND);
    assert_eq!(reason, "Connection lost to AA:BB");
    wait_for(|| service.connected_addresses().is_empty()).await;
}

#[tokio::test]
async fn test_incoming_bridge_write_failure_closes_session() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let options = ServiceOptions {
        incoming_bridge_url: Some(format!("ws://{}", server.local_addr().unwrap())),
        ..ServiceOptions::default()
    };
    let transport = Arc::new(DeadRadioTransport {
        inbound: Some("AA:BB".to_string()),
    });
    let (service, _events) = service_on(transport, options);
    service
        .start_listening("Serial", DEFAULT_SERVICE_UUID)
        .await
        .unwrap();

    let (tcp, _) = within(server.accept()).await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    ws.send(Message::Text(codec::encode(b"lost"))).await.unwrap();
    let (code, reason) = close_code(&mut ws).await;
    assert_eq!(code, CLOSE_LOST_INCOMING);
    assert_eq!(reason, "Connection closed to AA:BB");
    wait_for(|| service.connected_addresses().is_empty()).await;
}

#[tokio::test]
async fn test_incoming_bridge_unreachable_drops_link() {
    // Reserve a port, then free it so nothing answers there
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", unused.local_addr().unwrap());
    drop(unused);

    let transport = Arc::new(MemoryTransport::new());
    let options = ServiceOptions {
        incoming_bridge_url: Some(url),
        ..ServiceOptions::default()
    };
    let (service, mut events) = service_with(&transport, options);
    service
        .start_listening("Serial", DEFAULT_SERVICE_UUID)
        .await
        .unwrap();

    let mut remote = transport.dial_in("AA:BB", None, true).unwrap();
    within(async {
        loop {
            match events.recv().await {
                Some(SerialEvent::Error { .. }) => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await;

    wait_for(|| service.connected_addresses().is_empty()).await;
    let mut rest = Vec::new();
    within(remote.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
}
