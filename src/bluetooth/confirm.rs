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

//! Confirmation of incoming connections from untrusted peers.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Incoming connection awaiting a yes/no decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub address: String,
    pub name: Option<String>,
}

impl ConfirmRequest {
    /// Prompt text for a yes/no dialog.
    pub fn message(&self) -> String {
        format!(
            "Accept incoming connection from: {}({})",
            self.name.as_deref().unwrap_or("Unknown"),
            self.address
        )
    }
}

/// Decides whether an untrusted peer may connect.
#[async_trait]
pub trait ConnectionConfirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest) -> bool;
}

/// Gives the same answer to every request.
#[derive(Debug, Clone, Copy)]
pub struct StaticConfirmer {
    accept: bool,
}

impl StaticConfirmer {
    pub fn new(accept: bool) -> Self {
        Self { accept }
    }
}

#[async_trait]
impl ConnectionConfirmer for StaticConfirmer {
    async fn confirm(&self, request: &ConfirmRequest) -> bool {
        info!(
            "{} incoming connection from {}",
            if self.accept { "Accepting" } else { "Rejecting" },
            request.address
        );
        self.accept
    }
}

/// Request handed to the UI side of a [`ChannelConfirmer`].
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request: ConfirmRequest,
    response_tx: oneshot::Sender<bool>,
}

impl PendingConfirmation {
    pub fn respond(self, accept: bool) {
        if self.response_tx.send(accept).is_err() {
            warn!("Confirmation for {} arrived too late", self.request.address);
        }
    }

    pub fn accept(self) {
        self.respond(true);
    }

    pub fn reject(self) {
        self.respond(false);
    }
}

/// Forwards requests to a channel and waits for the answer.
///
/// A request dropped without an answer counts as a rejection.
#[derive(Debug, Clone)]
pub struct ChannelConfirmer {
    request_tx: mpsc::Sender<PendingConfirmation>,
}

impl ChannelConfirmer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (request_tx, request_rx) = mpsc::channel(capacity);
        (Self { request_tx }, request_rx)
    }
}

#[async_trait]
impl ConnectionConfirmer for ChannelConfirmer {
    async fn confirm(&self, request: &ConfirmRequest) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let pending = PendingConfirmation {
            request: request.clone(),
            response_tx,
        };

        if self.request_tx.send(pending).await.is_err() {
            warn!("No one is handling connection confirmations");
            return false;
        }

        response_rx.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConfirmRequest {
        ConfirmRequest {
            address: "AA:BB".to_string(),
            name: Some("Phone".to_string()),
        }
    }

    #[test]
    fn test_message() {
        assert_eq!(
            request().message(),
            "Accept incoming connection from: Phone(AA:BB)"
        );
    }

    #[tokio::test]
    async fn test_static() {
        assert!(StaticConfirmer::new(true).confirm(&request()).await);
        assert!(!StaticConfirmer::new(false).confirm(&request()).await);
    }

    #[tokio::test]
    async fn test_channel_accept() {
        let (confirmer, mut rx) = ChannelConfirmer::new(4);
        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.address, "AA:BB");
            pending.accept();
        });

        assert!(confirmer.confirm(&request()).await);
    }

    #[tokio::test]
    async fn test_channel_dropped_is_rejection() {
        let (confirmer, mut rx) = ChannelConfirmer::new(4);
        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            drop(pending);
        });

        assert!(!confirmer.confirm(&request()).await);
    }
}
