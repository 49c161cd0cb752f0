//! Send handle for one live peer connection.
//!
//! A [`PeerLink`] owns nothing but an unbounded command queue into the
//! connection's writer task, so a slow peer only ever backs up its own
//! queue. Links created with [`PeerLink::channel`] have no socket behind
//! them and are used to drive the mesh in memory.

use super::protocol::Envelope;
use crate::utils::{NetworkError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Liveness eviction
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// First frame was not a hello
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Frame exceeded the size limit
pub const CLOSE_TOO_LARGE: u16 = 1009;

/// Work queued for a connection's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Write one text frame
    Send(String),
    /// Send a close frame and stop
    Close {
        /// WebSocket close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Handle used to write to a peer
#[derive(Debug)]
pub struct PeerLink {
    /// Process-unique link id
    id: u64,
    /// URL we dialed, for outbound links
    dialed_url: Option<String>,
    /// Writer queue
    tx: mpsc::UnboundedSender<LinkCommand>,
    /// Wakes the reader when the link is closed locally
    shutdown: Notify,
}

impl PeerLink {
    /// Wrap a writer queue
    pub fn new(id: u64, dialed_url: Option<String>, tx: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self {
            id,
            dialed_url,
            tx,
            shutdown: Notify::new(),
        }
    }

    /// A link plus the receiving end of its writer queue
    pub fn channel(
        id: u64,
        dialed_url: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(id, dialed_url, tx)), rx)
    }

    /// Link id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// URL we dialed, if this is an outbound link
    pub fn dialed_url(&self) -> Option<&str> {
        self.dialed_url.as_deref()
    }

    /// Queue a raw text frame
    pub fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(LinkCommand::Send(text))
            .map_err(|_| NetworkError::LinkClosed { link_id: self.id }.into())
    }

    /// Queue an envelope
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_text(envelope.to_json()?)
    }

    /// Close the connection with a code and reason
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(LinkCommand::Close {
            code,
            reason: reason.to_string(),
        });
        self.shutdown.notify_one();
    }

    /// Whether the writer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.shutdown.notified().await;
    }
}
