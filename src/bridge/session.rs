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

//! Relay between one websocket and one link.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

use super::codec;
use super::server::BridgeContext;
use crate::bluetooth::{Consumer, ConnectionRegistry, Link, RELAY_CHANNEL_CAPACITY};
use crate::error::{Result, SerialError};
use crate::events::EventSender;

// Close codes below 1000 are invalid on the wire, so the HTTP-style status
// is carried in the private-use range as 4000 + status.

/// Close code when the peer cannot be reached or the link write fails.
pub const CLOSE_NOT_FOUND: u16 = 4404;
/// Close code when the link is already bridged by another session.
pub const CLOSE_CONFLICT: u16 = 4409;
/// Close code when an inbound link's write fails.
pub const CLOSE_LOST_INCOMING: u16 = 4400;

fn close_message(code: u16, reason: impl Into<String>) -> Message {
    let reason: String = reason.into();
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(data) => match String::from_utf8(data) {
            Ok(text) => Some(text),
            Err(_) => {
                warn!("Ignoring non UTF-8 binary frame");
                None
            }
        },
        _ => None,
    }
}

/// Notice sent to the websocket when writing to the link fails.
struct LostNotice {
    code: u16,
    reason: String,
}

/// Shuttle data between `ws` and `link` until either side ends.
///
/// Owned links are closed when the session ends; borrowed links go back to
/// their frame buffer.
async fn relay<S>(
    ws: WebSocketStream<S>,
    link: Arc<Link>,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    owned: bool,
    notice: LostNotice,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = link.address().to_string();
    info!("Bridge session attached to {}", address);
    let (mut sink, mut stream) = ws.split();

    let outcome = loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(data) => {
                    trace!("Relaying {} bytes from {}", data.len(), address);
                    if let Err(e) = sink.send(Message::Text(codec::encode(&data))).await {
                        break Err(SerialError::BridgeSession(e.to_string()));
                    }
                }
                None => {
                    debug!("Link {} closed, ending bridge session", address);
                    let reason = format!("Connection to {} closed", address);
                    let _ = sink.send(close_message(1000, reason)).await;
                    break Ok(());
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Websocket for {} closed", address);
                    break Ok(());
                }
                Some(Ok(message)) => {
                    let Some(text) = frame_text(message) else {
                        continue;
                    };
                    let data = match codec::decode(&text) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("Dropping frame for {}: {}", address, e);
                            continue;
                        }
                    };
                    if let Err(e) = link.write(&data).await {
                        let _ = sink.send(close_message(notice.code, notice.reason.clone())).await;
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Err(SerialError::BridgeSession(e.to_string())),
            }
        }
    };

    if owned {
        link.close().await;
    } else {
        link.detach_relay();
    }
    let _ = sink.close().await;
    info!("Bridge session for {} ended", address);

    outcome
}

/// Serve one websocket accepted by the bridge server.
///
/// The first frame names the peer. An existing link is borrowed; otherwise
/// a new outbound link is opened and owned by the session.
pub async fn serve_session<S>(mut ws: WebSocketStream<S>, context: BridgeContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = loop {
        match ws.next().await {
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(message)) => {
                if let Some(text) = frame_text(message) {
                    break text.trim().to_string();
                }
            }
            Some(Err(e)) => return Err(SerialError::BridgeSession(e.to_string())),
        }
    };
    debug!("Bridge session requested {}", address);

    let (link, chunks, owned) = match context.registry.get(&address) {
        Some(link) => match link.attach_relay() {
            Ok(chunks) => (link, chunks, false),
            Err(e) => {
                warn!("Cannot bridge {}: {}", address, e);
                let _ = ws.send(close_message(CLOSE_CONFLICT, e.to_string())).await;
                return Err(e);
            }
        },
        None => {
            info!("Trying to connect to {}", address);
            let (tx, chunks) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
            let connector = &context.connector;
            match connector
                .connect_with(&address, connector.service_uuid(), Consumer::Relay(tx))
                .await
            {
                Ok(link) => (link, chunks, true),
                Err(e) => {
                    warn!("Bridge connect to {} failed: {}", address, e);
                    let reason = format!("Could not connect to bluetooth device {}", address);
                    let _ = ws.send(close_message(CLOSE_NOT_FOUND, reason)).await;
                    return Err(e);
                }
            }
        }
    };

    let notice = LostNotice {
        code: CLOSE_NOT_FOUND,
        reason: format!("Connection lost to {}", address),
    };
    relay(ws, link, chunks, owned, notice).await
}

/// Bridge an accepted inbound link to a local websocket server.
///
/// The link is closed when the session ends or the websocket cannot be
/// opened.
pub async fn bridge_incoming(
    link: Arc<Link>,
    url: &str,
    registry: Arc<ConnectionRegistry>,
    events: EventSender,
) {
    let address = link.address().to_string();

    let ws = match tokio_tungstenite::connect_async(url).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            error!("Could not open bridge to {} for {}: {}", url, address, e);
            events
                .error(format!("Could not bridge {} to {}: {}", address, url, e))
                .await;
            link.close().await;
            registry.remove(&link);
            return;
        }
    };
    info!("Bridging incoming connection from {} to {}", address, url);

    let (tx, chunks) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    if let Err(e) = link.start(Consumer::Relay(tx), Arc::clone(&registry), events) {
        warn!("Could not start read task for {}: {}", address, e);
        registry.remove(&link);
        return;
    }

    let notice = LostNotice {
        code: CLOSE_LOST_INCOMING,
        reason: format!("Connection closed to {}", address),
    };
    if let Err(e) = relay(ws, link, chunks, true, notice).await {
        debug!("Incoming bridge for {} ended: {}", address, e);
    }
}
