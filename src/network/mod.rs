//! The federation mesh engine.
//!
//! [`Mesh`] ties the shared [`MeshDirectory`] to the node identity and the
//! event feed. Its behavior is split by concern: envelope signing and
//! verification, the inbound gate, frame handlers, peer links, presence,
//! delivery, file relay, public fanout and liveness each extend `Mesh` from
//! their own module.

pub mod delivery;
pub mod directory;
pub mod envelope;
pub mod events;
pub mod files;
pub mod gate;
pub mod handlers;
pub mod heartbeat;
pub mod peers;
pub mod presence;
pub mod public;
pub mod validators;

pub use delivery::{OpaqueMessage, Routed};
pub use directory::{DirectorySnapshot, MeshDirectory, SeenKey, UserLocation};
pub use events::{FilePhase, MeshEvent, PresenceChange, PublicUpdateKind};
pub use gate::{ConnectionState, FrameOutcome, HandshakeState, TokenBucket};
pub use heartbeat::{Eviction, LivenessTasks};

use crate::crypto::ServerIdentity;
use crate::transport::{Envelope, PeerLink};
use crate::utils::MeshConfig;
use log::{debug, info, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One mesh node
pub struct Mesh {
    /// Our id and signing keys
    identity: ServerIdentity,
    /// Cached string form of our id
    self_id: String,
    /// Node configuration
    config: MeshConfig,
    /// All shared mesh state
    directory: RwLock<MeshDirectory>,
    /// Feed to the local application layer
    events: mpsc::UnboundedSender<MeshEvent>,
    /// Link id allocator
    next_link_id: AtomicU64,
}

impl Mesh {
    /// Create a mesh node and the receiving end of its event feed
    pub fn new(
        config: MeshConfig,
        identity: ServerIdentity,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let directory = MeshDirectory::new(config.limits.seen_ttl_ms);

        let mesh = Arc::new(Self {
            self_id: identity.id_string(),
            identity,
            config,
            directory: RwLock::new(directory),
            events,
            next_link_id: AtomicU64::new(1),
        });
        (mesh, event_rx)
    }

    /// Our server id
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Our identity
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Node configuration
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// URL we advertise to peers
    pub fn self_url(&self) -> String {
        self.config.network.self_url()
    }

    /// Allocate a link id
    pub fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Read access to the directory
    pub async fn directory(&self) -> RwLockReadGuard<'_, MeshDirectory> {
        self.directory.read().await
    }

    /// Diagnostic counters
    pub async fn snapshot(&self) -> DirectorySnapshot {
        self.directory.read().await.snapshot()
    }

    /// Forget every registration that uses a closed link
    pub async fn unregister_link(&self, link_id: u64) {
        let removed = self.directory.write().await.remove_link(link_id);
        for server_id in removed {
            info!("Link to {server_id} closed");
        }
    }

    /// Register a link under a server id
    pub async fn register_link(
        &self,
        server_id: &str,
        link: Arc<PeerLink>,
        url: Option<String>,
        pubkey_b64url: Option<String>,
    ) {
        let replaced = self
            .directory
            .write()
            .await
            .register_link(server_id, link.clone(), url, pubkey_b64url, now_ms());
        match replaced {
            Some(old) => info!(
                "Link to {server_id} replaced (link {} -> {})",
                old.id(),
                link.id()
            ),
            None => debug!("Link {} registered for {server_id}", link.id()),
        }
    }

    /// Publish an event to the local layer
    pub(crate) fn emit(&self, event: MeshEvent) {
        trace!("Event: {}", event.name());
        if self.events.send(event).is_err() {
            debug!("Event feed closed; dropping event");
        }
    }

    /// Send to every linked server except `except_server` and link
    /// `except_link`; per-peer failures are skipped. Returns the number of
    /// links written to.
    pub(crate) async fn send_to_all_peers(
        &self,
        envelope: &Envelope,
        except_server: Option<&str>,
        except_link: Option<u64>,
    ) -> usize {
        let targets = self
            .directory
            .read()
            .await
            .links_except(except_server, except_link);

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                debug!("Could not serialize {}: {e}", envelope.kind);
                return 0;
            }
        };

        let mut sent = 0;
        for (server_id, link) in targets {
            match link.send_text(text.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!("Send of {} to {server_id} failed: {e}", envelope.kind),
            }
        }
        sent
    }

    /// Send to one linked server
    pub(crate) async fn send_to_server(&self, server_id: &str, envelope: &Envelope) -> bool {
        let Some(link) = self.directory.read().await.link(server_id) else {
            return false;
        };
        match link.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                debug!("Send of {} to {server_id} failed: {e}", envelope.kind);
                false
            }
        }
    }
}
