//! Frame dispatch and the bootstrap/plumbing handlers.
//!
//! Presence, delivery, file and public-channel frames are handled in their
//! own modules; this one routes to them and owns the handshake, discovery,
//! heartbeat, `ACK` and `ERROR` frames.

use super::gate::ConnectionState;
use super::{Mesh, MeshEvent};
use crate::transport::{AnnouncePayload, Envelope, FrameType, HelloPayload, WelcomePayload};
use crate::utils::Result;
use log::{debug, info, trace};
use serde_json::json;
use std::sync::Arc;

impl Mesh {
    /// Route a gated frame to its handler
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        kind: FrameType,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        match kind {
            FrameType::ServerHelloJoin => self.on_hello_join(envelope, conn).await,
            FrameType::ServerWelcome => self.on_welcome(envelope, conn).await,
            FrameType::ServerAnnounce => self.on_announce(envelope).await,
            FrameType::ServerHelloLink => self.on_hello_link(envelope, conn).await,

            FrameType::UserAdvertise => self.on_user_advertise(envelope, conn).await,
            FrameType::UserRemove => self.on_user_remove(envelope, conn).await,

            FrameType::ServerDeliver => self.on_server_deliver(envelope, conn).await,

            FrameType::MsgPublicChannel => self.on_public_message(envelope, conn).await,
            FrameType::PublicChannelAdd | FrameType::PublicChannelUpdated => {
                self.on_public_update(kind, envelope, conn).await
            }
            FrameType::PublicChannelKeyShare => self.on_public_key_share(envelope, conn).await,

            FrameType::FileStart | FrameType::FileChunk | FrameType::FileEnd => {
                self.on_file_frame(kind, envelope, conn).await
            }

            FrameType::Heartbeat => {
                trace!("Heartbeat from {}", envelope.from);
                Ok(())
            }
            FrameType::Ack => {
                self.emit(MeshEvent::AckReceived {
                    from: envelope.from.clone(),
                    payload: envelope.payload.clone(),
                });
                Ok(())
            }
            FrameType::Error => {
                debug!("ERROR from {}: {}", envelope.from, envelope.payload);
                self.emit(MeshEvent::ErrorReceived {
                    from: envelope.from.clone(),
                    payload: envelope.payload.clone(),
                });
                Ok(())
            }
        }
    }

    /// A new server asks us, as introducer, to join the mesh
    async fn on_hello_join(&self, envelope: &Envelope, conn: &ConnectionState) -> Result<()> {
        let hello: HelloPayload = envelope.payload_as()?;
        self.remember_peer(&envelope.from, Some(&hello.url), Some(&hello.pubkey_b64url))
            .await;

        if !self.config().network.introducer_mode {
            info!("SERVER_HELLO_JOIN from {} ignored; not an introducer", envelope.from);
            return Ok(());
        }

        self.register_link(
            &envelope.from,
            conn.link.clone(),
            Some(hello.url.clone()),
            Some(hello.pubkey_b64url.clone()),
        )
        .await;

        let peers = self
            .directory
            .read()
            .await
            .known_peers(&[envelope.from.as_str(), self.self_id()]);
        info!(
            "Welcoming {} at {} with {} known peer(s)",
            envelope.from,
            hello.url,
            peers.len()
        );

        let welcome = self.build_signed(
            FrameType::ServerWelcome,
            &envelope.from,
            json!({ "assigned_id": envelope.from, "peers": peers }),
        )?;
        conn.link.send(&welcome)
    }

    /// An introducer answered our join
    async fn on_welcome(self: &Arc<Self>, envelope: &Envelope, conn: &ConnectionState) -> Result<()> {
        let welcome: WelcomePayload = envelope.payload_as()?;
        if welcome.assigned_id != self.self_id() {
            info!(
                "Introducer {} assigned id {}; keeping configured id {}",
                envelope.from,
                welcome.assigned_id,
                self.self_id()
            );
        }

        self.remember_peer(
            &envelope.from,
            conn.link.dialed_url(),
            conn.key_hint.as_deref(),
        )
        .await;
        self.register_link(&envelope.from, conn.link.clone(), None, None)
            .await;

        for peer in &welcome.peers {
            if peer.server_id == self.self_id() || peer.server_id == envelope.from {
                continue;
            }
            self.remember_peer(&peer.server_id, Some(&peer.url), peer.pubkey_b64url.as_deref())
                .await;
            if !self.directory.read().await.has_link(&peer.server_id) {
                self.spawn_connect(peer.url.clone(), Some(peer.server_id.clone()));
            }
        }

        info!(
            "Welcomed by {} with {} peer(s)",
            envelope.from,
            welcome.peers.len()
        );
        self.announce_self().await?;
        Ok(())
    }

    /// A server announced its id, URL and key
    async fn on_announce(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let announce: AnnouncePayload = envelope.payload_as()?;
        if announce.server_id != envelope.from {
            debug!(
                "Dropping SERVER_ANNOUNCE from {} claiming to be {}",
                envelope.from, announce.server_id
            );
            return Ok(());
        }

        self.remember_peer(
            &announce.server_id,
            Some(&announce.url),
            announce.pubkey_b64url.as_deref(),
        )
        .await;

        if !self.directory.read().await.has_link(&announce.server_id) {
            self.spawn_connect(announce.url, Some(announce.server_id));
        }
        Ok(())
    }

    /// A peer opened a direct link to us
    async fn on_hello_link(&self, envelope: &Envelope, conn: &ConnectionState) -> Result<()> {
        let hello: HelloPayload = envelope.payload_as()?;
        self.register_link(
            &envelope.from,
            conn.link.clone(),
            Some(hello.url.clone()),
            Some(hello.pubkey_b64url.clone()),
        )
        .await;
        self.remember_peer(&envelope.from, Some(&hello.url), Some(&hello.pubkey_b64url))
            .await;
        info!("Linked server {} at {}", envelope.from, hello.url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::crypto::signing::test_keys;
    use crate::network::{FrameOutcome, MeshEvent};
    use crate::transport::{FrameType, PeerInfo, WelcomePayload, BROADCAST};
    use crate::utils::MeshConfig;
    use serde_json::json;

    fn hello_payload(mesh: &crate::network::Mesh) -> serde_json::Value {
        json!({"url": mesh.self_url(), "pubkey_b64url": mesh.identity().public_b64url()})
    }

    #[tokio::test]
    async fn test_join_gets_welcome_listing_other_peers() {
        let [(intro, _), (joiner, _), (other, _)] = nodes3();
        intro
            .remember_peer(other.self_id(), Some("ws://other:1"), Some(other.identity().public_b64url()))
            .await;

        let (mut conn, mut rx) = linked_conn(&intro);
        let join = signed_by(&joiner, FrameType::ServerHelloJoin, "ws://intro", hello_payload(&joiner));
        let outcome = intro.process_frame(&mut conn, &join.to_json().unwrap()).await;
        assert_eq!(outcome, FrameOutcome::Dispatched(FrameType::ServerHelloJoin));

        let welcomes = drain_kind(&mut rx, FrameType::ServerWelcome);
        assert_eq!(welcomes.len(), 1);
        assert_eq!(welcomes[0].to, joiner.self_id());
        let welcome: WelcomePayload = welcomes[0].payload_as().unwrap();
        assert_eq!(welcome.assigned_id, joiner.self_id());
        assert_eq!(
            welcome.peers,
            vec![PeerInfo {
                server_id: other.self_id().to_string(),
                url: "ws://other:1".to_string(),
                pubkey_b64url: Some(other.identity().public_b64url().to_string()),
            }]
        );

        let dir = intro.directory().await;
        assert!(dir.has_link(joiner.self_id()));
        assert_eq!(
            dir.peer_key(joiner.self_id()).as_deref(),
            Some(joiner.identity().public_b64url())
        );
    }

    #[tokio::test]
    async fn test_join_ignored_when_not_introducer() {
        let mut config = MeshConfig::default();
        config.network.introducer_mode = false;
        let (intro, _) = node_with(test_keys::key_a(), config);
        let (joiner, _) = node(test_keys::key_b());

        let (mut conn, mut rx) = linked_conn(&intro);
        let join = signed_by(&joiner, FrameType::ServerHelloJoin, "ws://intro", hello_payload(&joiner));
        intro.process_frame(&mut conn, &join.to_json().unwrap()).await;

        assert!(drain(&mut rx).is_empty());
        assert!(!intro.directory().await.has_link(joiner.self_id()));
    }

    #[tokio::test]
    async fn test_welcome_registers_introducer_and_announces() {
        let [(intro, _), (joiner, _), (other, _)] = nodes3();
        let (link, mut rx) = crate::transport::PeerLink::channel(joiner.next_link_id(), Some("ws://intro:1".into()));
        let mut conn = crate::network::ConnectionState::outbound(
            link,
            &joiner.config().limits,
            Some(intro.identity().public_b64url().to_string()),
        );

        let welcome = signed_by(
            &intro,
            FrameType::ServerWelcome,
            joiner.self_id(),
            json!({
                "assigned_id": joiner.self_id(),
                "peers": [{
                    "server_id": other.self_id(),
                    "url": "ws://127.0.0.1:9",
                    "pubkey_b64url": other.identity().public_b64url()
                }]
            }),
        );
        let outcome = joiner.process_frame(&mut conn, &welcome.to_json().unwrap()).await;
        assert_eq!(outcome, FrameOutcome::Dispatched(FrameType::ServerWelcome));

        let dir = joiner.directory().await;
        assert!(dir.has_link(intro.self_id()));
        assert_eq!(dir.address(intro.self_id()).unwrap().url.as_deref(), Some("ws://intro:1"));
        assert_eq!(
            dir.peer_key(other.self_id()).as_deref(),
            Some(other.identity().public_b64url())
        );
        drop(dir);

        let announces = drain_kind(&mut rx, FrameType::ServerAnnounce);
        assert_eq!(announces.len(), 1);
        assert_eq!(announces[0].payload["server_id"], json!(joiner.self_id()));
    }

    #[tokio::test]
    async fn test_welcome_with_other_assigned_id_keeps_ours() {
        let (intro, _) = node(test_keys::key_a());
        let (joiner, _) = node(test_keys::key_b());
        let (link, _rx) = crate::transport::PeerLink::channel(1, Some("ws://intro:1".into()));
        let mut conn = crate::network::ConnectionState::outbound(
            link,
            &joiner.config().limits,
            Some(intro.identity().public_b64url().to_string()),
        );

        let original_id = joiner.self_id().to_string();
        let welcome = signed_by(
            &intro,
            FrameType::ServerWelcome,
            joiner.self_id(),
            json!({"assigned_id": "3f1c2a9e-6d4b-4c1a-9e2f-0b8d7c6a5e4f", "peers": []}),
        );
        joiner.process_frame(&mut conn, &welcome.to_json().unwrap()).await;
        assert_eq!(joiner.self_id(), original_id);
    }

    #[tokio::test]
    async fn test_announce_remembers_peer() {
        let [(a, _), (b, _), (c, _)] = nodes3();
        know(&b, &a).await;
        let (mut conn, _rx) = linked_conn(&b);

        let announce = signed_by(
            &c,
            FrameType::ServerAnnounce,
            BROADCAST,
            json!({"server_id": c.self_id(), "url": "ws://127.0.0.1:9", "pubkey_b64url": c.identity().public_b64url()}),
        );
        b.process_frame(&mut conn, &announce.to_json().unwrap()).await;
        assert_eq!(
            b.directory().await.peer_key(c.self_id()).as_deref(),
            Some(c.identity().public_b64url())
        );
    }

    #[tokio::test]
    async fn test_announce_for_someone_else_is_dropped() {
        let [(a, _), (b, _), (c, _)] = nodes3();
        let (mut conn, _rx) = linked_conn(&b);

        let spoof = a.build(
            FrameType::ServerAnnounce,
            BROADCAST,
            json!({"server_id": c.self_id(), "url": "ws://evil:1", "pubkey_b64url": a.identity().public_b64url()}),
        );
        b.process_frame(&mut conn, &spoof.to_json().unwrap()).await;
        assert!(b.directory().await.address(c.self_id()).is_none());
    }

    #[tokio::test]
    async fn test_ack_and_error_become_events() {
        let (a, _) = node(test_keys::key_a());
        let (b, mut events_b) = node(test_keys::key_b());
        know(&b, &a).await;
        let (mut conn, _rx) = linked_conn(&b);

        let ack = signed_by(&a, FrameType::Ack, b.self_id(), json!({"ref": {"type": "SERVER_DELIVER", "from": b.self_id(), "ts": 1}}));
        let err = signed_by(&a, FrameType::Error, b.self_id(), json!({"code": "USER_NOT_FOUND"}));
        b.process_frame(&mut conn, &ack.to_json().unwrap()).await;
        b.process_frame(&mut conn, &err.to_json().unwrap()).await;

        let seen = events(&mut events_b);
        assert!(matches!(&seen[0], MeshEvent::AckReceived { from, .. } if from == a.self_id()));
        assert!(matches!(&seen[1], MeshEvent::ErrorReceived { payload, .. } if payload["code"] == "USER_NOT_FOUND"));
    }
}
