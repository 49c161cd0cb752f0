//! Public channel fanout: messages and metadata reach every server, with a
//! local echo on the originating node.

use super::delivery::object_with;
use super::directory::{Discriminant, SeenKey};
use super::gate::ConnectionState;
use super::{now_ms, Mesh, MeshEvent, OpaqueMessage, PublicUpdateKind, Routed};
use crate::transport::{Envelope, ErrorCode, FrameType, BROADCAST};
use crate::utils::{MeshError, Result};
use log::debug;
use serde_json::Value;

/// Characters of ciphertext that go into a public message fingerprint
const CONTENT_PREFIX_CHARS: usize = 16;

impl PublicUpdateKind {
    /// Frame type carrying this update
    pub fn frame_type(self) -> FrameType {
        match self {
            Self::Add => FrameType::PublicChannelAdd,
            Self::Updated => FrameType::PublicChannelUpdated,
        }
    }
}

impl Mesh {
    /// Publish a public channel message locally and to every peer
    pub async fn broadcast_public_message(&self, message: &OpaqueMessage) -> Result<usize> {
        let payload = serde_json::to_value(message)?;
        let envelope = self.build_signed(FrameType::MsgPublicChannel, BROADCAST, payload)?;
        self.emit(MeshEvent::PublicMessageReceived {
            payload: envelope.payload.clone(),
        });
        Ok(self.send_to_all_peers(&envelope, None, None).await)
    }

    /// Publish channel metadata locally and to every peer
    pub async fn broadcast_public_update(&self, kind: PublicUpdateKind, payload: Value) -> Result<usize> {
        let envelope = self.build_signed(kind.frame_type(), BROADCAST, payload)?;
        self.emit(MeshEvent::PublicUpdateReceived {
            kind,
            payload: envelope.payload.clone(),
        });
        Ok(self.send_to_all_peers(&envelope, None, None).await)
    }

    /// Route a wrapped channel key to the server hosting `user_id`
    pub async fn send_public_key_share(&self, user_id: &str, fields: &Value) -> Result<Routed> {
        let payload = object_with("user_id", user_id, fields)?;
        self.route_to_user(FrameType::PublicChannelKeyShare, user_id, payload, |payload| {
            MeshEvent::PublicKeyShareReceived { payload }
        })
        .await
    }

    pub(crate) async fn on_public_message(
        &self,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        let prefix: String = envelope
            .payload_str("ciphertext")
            .unwrap_or_default()
            .chars()
            .take(CONTENT_PREFIX_CHARS)
            .collect();
        let key = SeenKey::new(
            FrameType::MsgPublicChannel,
            &envelope.from,
            "",
            Discriminant::TimestampPrefix(envelope.ts, prefix),
        );
        if !self.directory.write().await.check_and_mark(key, now_ms()) {
            debug!("Duplicate MSG_PUBLIC_CHANNEL from {}", envelope.from);
            return Ok(());
        }

        self.emit(MeshEvent::PublicMessageReceived {
            payload: envelope.payload.clone(),
        });
        self.send_to_all_peers(envelope, Some(&envelope.from), Some(conn.link.id()))
            .await;
        Ok(())
    }

    pub(crate) async fn on_public_update(
        &self,
        kind: FrameType,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        let update = match kind {
            FrameType::PublicChannelAdd => PublicUpdateKind::Add,
            FrameType::PublicChannelUpdated => PublicUpdateKind::Updated,
            other => return Err(MeshError::unexpected(format!("{other} is not a channel update"))),
        };
        let key = SeenKey::new(kind, &envelope.from, "", Discriminant::Timestamp(envelope.ts));
        if !self.directory.write().await.check_and_mark(key, now_ms()) {
            debug!("Duplicate {kind} from {}", envelope.from);
            return Ok(());
        }

        self.emit(MeshEvent::PublicUpdateReceived {
            kind: update,
            payload: envelope.payload.clone(),
        });
        self.send_to_all_peers(envelope, Some(&envelope.from), Some(conn.link.id()))
            .await;
        Ok(())
    }

    pub(crate) async fn on_public_key_share(
        &self,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        let Some(user_id) = envelope.payload_str("user_id") else {
            return Err(MeshError::rejected(ErrorCode::BadPayload, "missing user_id"));
        };
        let key = SeenKey::new(
            FrameType::PublicChannelKeyShare,
            &envelope.from,
            user_id,
            Discriminant::Timestamp(envelope.ts),
        );
        self.route_inbound(envelope, conn, user_id, key, |payload| {
            MeshEvent::PublicKeyShareReceived { payload }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::crypto::signing::test_keys;
    use serde_json::json;

    const USER: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    #[tokio::test]
    async fn test_broadcast_echoes_locally_then_fans_out() {
        let [(a, mut events_a), (b, _), (c, _)] = nodes3();
        let (_, mut rx_b) = link_to(&a, &b).await;
        let (_, mut rx_c) = link_to(&a, &c).await;

        let sent = a
            .broadcast_public_message(&OpaqueMessage::new("aGVsbG8gd29ybGQ"))
            .await
            .unwrap();
        assert_eq!(sent, 2);
        assert!(matches!(
            &events(&mut events_a)[..],
            [MeshEvent::PublicMessageReceived { payload }] if payload["ciphertext"] == "aGVsbG8gd29ybGQ"
        ));
        assert_eq!(drain_kind(&mut rx_b, FrameType::MsgPublicChannel).len(), 1);
        assert_eq!(drain_kind(&mut rx_c, FrameType::MsgPublicChannel).len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_message_forwarded_once_except_origin() {
        let [(a, _), (b, mut events_b), (c, _)] = nodes3();
        let (link_a, mut rx_a) = link_to(&b, &a).await;
        let (_, mut rx_c) = link_to(&b, &c).await;
        let mut conn = crate::network::ConnectionState::outbound(link_a, &b.config().limits, None);

        let message = signed_by(
            &a,
            FrameType::MsgPublicChannel,
            BROADCAST,
            json!({"ciphertext": "aGVsbG8gd29ybGQ"}),
        );
        let text = message.to_json().unwrap();
        b.process_frame(&mut conn, &text).await;
        b.process_frame(&mut conn, &text).await;

        assert_eq!(drain_kind(&mut rx_c, FrameType::MsgPublicChannel), vec![message]);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(events(&mut events_b).len(), 1);
    }

    #[tokio::test]
    async fn test_same_timestamp_different_content_both_pass() {
        let (a, _) = node(test_keys::key_a());
        let (b, mut events_b) = node(test_keys::key_b());
        know(&b, &a).await;
        let (mut conn, _rx) = linked_conn(&b);

        let first = signed_by(&a, FrameType::MsgPublicChannel, BROADCAST, json!({"ciphertext": "Zmlyc3Q"}));
        let mut second = signed_by(&a, FrameType::MsgPublicChannel, BROADCAST, json!({"ciphertext": "c2Vjb25k"}));
        second.ts = first.ts;
        b.process_frame(&mut conn, &first.to_json().unwrap()).await;
        b.process_frame(&mut conn, &second.to_json().unwrap()).await;
        assert_eq!(events(&mut events_b).len(), 2);
    }

    #[tokio::test]
    async fn test_channel_update_echo_and_inbound() {
        let (a, mut events_a) = node(test_keys::key_a());
        let (b, mut events_b) = node(test_keys::key_b());
        let (_, mut rx_b) = link_to(&a, &b).await;

        a.broadcast_public_update(PublicUpdateKind::Add, json!({"members": [USER]}))
            .await
            .unwrap();
        assert!(matches!(
            &events(&mut events_a)[..],
            [MeshEvent::PublicUpdateReceived { kind: PublicUpdateKind::Add, .. }]
        ));

        know(&b, &a).await;
        let (mut conn, _rx) = linked_conn(&b);
        let frames = drain_kind(&mut rx_b, FrameType::PublicChannelAdd);
        assert_eq!(frames.len(), 1);
        b.process_frame(&mut conn, &frames[0].to_json().unwrap()).await;
        b.process_frame(&mut conn, &frames[0].to_json().unwrap()).await;
        assert_eq!(
            events(&mut events_b),
            vec![MeshEvent::PublicUpdateReceived {
                kind: PublicUpdateKind::Add,
                payload: json!({"members": [USER]}),
            }]
        );
    }

    #[tokio::test]
    async fn test_key_share_routes_to_host() {
        let (a, mut events_a) = node(test_keys::key_a());
        let (b, mut events_b) = node(test_keys::key_b());
        let (_, mut rx_b) = link_to(&a, &b).await;
        know(&b, &a).await;
        b.advertise_user(USER, json!({})).await.unwrap();

        assert_eq!(
            a.send_public_key_share(USER, &json!({"wrapped_key_b64url": "a2V5"})).await.unwrap(),
            Routed::Nowhere
        );
        a.directory
            .write()
            .await
            .set_location(USER, crate::network::UserLocation::Remote(b.self_id().to_string()));
        a.send_public_key_share(USER, &json!({"wrapped_key_b64url": "a2V5"}))
            .await
            .unwrap();
        assert!(events(&mut events_a).is_empty());

        let (mut conn, _rx) = linked_conn(&b);
        let shares = drain_kind(&mut rx_b, FrameType::PublicChannelKeyShare);
        b.process_frame(&mut conn, &shares[0].to_json().unwrap()).await;
        assert_eq!(
            events(&mut events_b),
            vec![MeshEvent::PublicKeyShareReceived {
                payload: json!({"user_id": USER, "wrapped_key_b64url": "a2V5"}),
            }]
        );
    }
}
