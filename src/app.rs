//! Node lifecycle: identity, listener, introducers, liveness and the event
//! feed.

use crate::{
    crypto::{ServerIdentity, ServerKeyPair, DEFAULT_KEY_BITS},
    network::{Mesh, MeshEvent, PresenceChange},
    transport::ws,
    utils::{ConfigError, MeshConfig, NetworkError, Result},
};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A running mesh node
pub struct App {
    /// Node configuration
    config: MeshConfig,
    /// Mesh engine
    mesh: Arc<Mesh>,
    /// Event feed from the mesh
    events: mpsc::UnboundedReceiver<MeshEvent>,
    /// When the node was created
    started_at: chrono::DateTime<chrono::Utc>,
}

impl App {
    /// Create a node, loading or creating its identity
    pub async fn new(config: MeshConfig) -> Result<Self> {
        let identity = Self::load_or_create_identity(&config)?;
        info!("Server identity: {identity}");

        let (mesh, events) = Mesh::new(config.clone(), identity);
        Ok(Self {
            config,
            mesh,
            events,
            started_at: chrono::Utc::now(),
        })
    }

    /// Identity from configuration, else from `keys_dir`, else a fresh one
    /// saved to `keys_dir`
    fn load_or_create_identity(config: &MeshConfig) -> Result<ServerIdentity> {
        let configured = &config.identity;

        if let Some(private) = &configured.private_key_b64url {
            let keypair = ServerKeyPair::from_private_b64url(private)?;
            if let Some(public) = &configured.public_key_b64url {
                if !keypair.matches_public(public)? {
                    return Err(ConfigError::InvalidValue {
                        field: "identity.public_key_b64url".to_string(),
                        value: "does not match the private key".to_string(),
                    }
                    .into());
                }
            }
            let server_id = configured.server_id.unwrap_or_else(Uuid::new_v4);
            return Ok(ServerIdentity::new(server_id, keypair));
        }

        let keys_dir = &config.storage.keys_dir;
        if let Some(mut identity) = ServerIdentity::load(keys_dir)? {
            if let Some(server_id) = configured.server_id {
                identity.server_id = server_id;
            }
            debug!("Loaded identity from {}", keys_dir.display());
            return Ok(identity);
        }

        info!("No identity found, generating a {DEFAULT_KEY_BITS}-bit RSA key");
        let mut identity = ServerIdentity::generate(DEFAULT_KEY_BITS)?;
        if let Some(server_id) = configured.server_id {
            identity.server_id = server_id;
        }
        identity.save(keys_dir)?;
        info!("Saved identity to {}", keys_dir.display());
        Ok(identity)
    }

    /// The mesh engine, for the local layer to call into
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// Listen, join the mesh and log the event feed until the listener dies
    pub async fn run(&mut self) -> Result<()> {
        let address = self.config.network.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| NetworkError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        info!(
            "Mesh node {} listening on {address}, advertising {}",
            self.mesh.self_id(),
            self.mesh.self_url()
        );

        let mut listener_task = tokio::spawn(ws::serve(Arc::clone(&self.mesh), listener));

        let joined = self.mesh.bootstrap_introducers().await;
        if !self.config.network.introducers.is_empty() {
            info!(
                "Joined via {joined} of {} introducer(s)",
                self.config.network.introducers.len()
            );
        }

        let liveness = self.mesh.start_liveness();

        let result = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => Self::handle_event(&event),
                    None => break Ok(()),
                },
                finished = &mut listener_task => {
                    break match finished {
                        Ok(result) => result,
                        Err(e) => Err(NetworkError::Transport { reason: e.to_string() }.into()),
                    };
                }
            }
        };

        liveness.stop();
        result
    }

    fn handle_event(event: &MeshEvent) {
        match event {
            MeshEvent::UserDelivered { payload } => {
                info!("Delivered message for user {}", payload["user_id"]);
            }
            MeshEvent::PresenceChanged {
                change,
                user_id,
                server_id,
                ..
            } => match change {
                PresenceChange::Advertised => info!("User {user_id} is on {server_id}"),
                PresenceChange::Removed => info!("User {user_id} left {server_id}"),
            },
            MeshEvent::PublicMessageReceived { .. } => info!("Public channel message"),
            MeshEvent::PublicUpdateReceived { kind, .. } => {
                info!("Public channel update: {kind:?}");
            }
            MeshEvent::PublicKeyShareReceived { payload } => {
                info!("Public channel key for user {}", payload["user_id"]);
            }
            MeshEvent::FilePhaseReceived { phase, payload } => {
                debug!("File {phase:?} for user {}", payload["to_user"]);
            }
            MeshEvent::AckReceived { from, payload } => {
                debug!("ACK from {from}: {payload}");
            }
            MeshEvent::ErrorReceived { from, payload } => {
                warn!("Peer {from} reported {}", payload["code"]);
            }
        }
    }

    /// Node statistics
    pub async fn stats(&self) -> AppStats {
        let snapshot = self.mesh.snapshot().await;

        AppStats {
            server_id: self.mesh.self_id().to_string(),
            url: self.mesh.self_url(),
            linked_peers: snapshot.linked_peers.len(),
            known_peers: snapshot.known_peers,
            local_users: snapshot.local_users,
            remote_users: snapshot.remote_users,
            seen_entries: snapshot.seen_entries,
            uptime: chrono::Utc::now().signed_duration_since(self.started_at),
        }
    }

    /// Close every link
    pub async fn shutdown(self) -> Result<()> {
        let closed = self.mesh.close_all_links("server shutting down").await;
        info!("Shut down; closed {closed} link(s)");
        Ok(())
    }
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct AppStats {
    /// Server id
    pub server_id: String,
    /// Advertised URL
    pub url: String,
    /// Servers with a live link
    pub linked_peers: usize,
    /// Servers with an address record
    pub known_peers: usize,
    /// Users hosted here
    pub local_users: usize,
    /// Users hosted elsewhere
    pub remote_users: usize,
    /// Live replay fingerprints
    pub seen_entries: usize,
    /// Time since start
    pub uptime: chrono::Duration,
}
