//! Cluster wakeup fan-out.
//!
//! Creates and cancels notify every node's dispatcher worker so peers can
//! shorten their sleep. Delivery is advisory: the claim transaction is the
//! safety net, so a lost hint only means a peer keeps its current (larger)
//! sleep until its next refresh.

use crate::config::PeerSource;
use crate::worker::WorkerMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// The two fan-out messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WakeupHint {
    /// Re-consult the store (sent on cancel).
    Refresh,
    /// A row with this `expires_at` was just inserted.
    NextExpiry { expires_at: DateTime<Utc> },
}

/// Delivers hints to a single peer. Network deployments implement this over
/// their own wire; in-process peers use [`MailboxTransport`].
#[async_trait::async_trait]
pub trait HintTransport: Send + Sync {
    async fn send(&self, peer: &str, hint: WakeupHint) -> anyhow::Result<()>;
}

/// Fire-and-forget broadcast to all known peers.
#[derive(Clone)]
pub struct Fanout {
    peers: PeerSource,
    transport: Arc<dyn HintTransport>,
}

impl Fanout {
    pub fn new(peers: PeerSource, transport: Arc<dyn HintTransport>) -> Self {
        Self { peers, transport }
    }

    /// Send `hint` to every peer. Each delivery runs on its own task;
    /// failures are logged and never retried.
    pub fn broadcast(&self, hint: WakeupHint) {
        for peer in self.peers.peers() {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(error) = transport.send(&peer, hint).await {
                    tracing::warn!(peer = %peer, ?hint, %error, "failed to deliver wakeup hint");
                }
            });
        }
    }
}

/// In-process transport: peers are workers in the same process, addressed by
/// the name they were registered under.
#[derive(Default)]
pub struct MailboxTransport {
    mailboxes: RwLock<HashMap<String, mpsc::Sender<WorkerMessage>>>,
}

impl MailboxTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, peer: impl Into<String>, mailbox: mpsc::Sender<WorkerMessage>) {
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.insert(peer.into(), mailbox);
    }
}

#[async_trait::async_trait]
impl HintTransport for MailboxTransport {
    async fn send(&self, peer: &str, hint: WakeupHint) -> anyhow::Result<()> {
        let mailbox = {
            let mailboxes = self.mailboxes.read().await;
            mailboxes.get(peer).cloned()
        }
        .ok_or_else(|| anyhow::anyhow!("unknown peer: {peer}"))?;

        let message = match hint {
            WakeupHint::Refresh => WorkerMessage::Refresh,
            WakeupHint::NextExpiry { expires_at } => WorkerMessage::SetNextExpiry(expires_at),
        };
        mailbox
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("mailbox for peer {peer} is closed"))
    }
}
