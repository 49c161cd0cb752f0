//! Routing of opaque payloads to the server hosting a user.
//!
//! Delivery, file relay and public-channel key shares all route the same
//! way; the shared paths live here.

use super::directory::{Discriminant, SeenKey, UserLocation};
use super::gate::ConnectionState;
use super::{now_ms, Mesh, MeshEvent};
use crate::transport::{Envelope, ErrorCode, FrameType};
use crate::utils::{MeshError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// End-to-end encrypted content the mesh carries but never reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueMessage {
    /// Encrypted body, base64url
    pub ciphertext: String,
    /// Sending user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Sending user's public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_pub: Option<String>,
    /// Sender's signature over the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sig: Option<String>,
}

impl OpaqueMessage {
    /// Message with only a ciphertext
    pub fn new(ciphertext: impl Into<String>) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            ..Self::default()
        }
    }
}

/// Where an outbound payload went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Handed to the local layer
    Local,
    /// Sent to the hosting server
    Remote(String),
    /// No route; the caller decides what to tell the user
    Nowhere,
}

/// Prefix `fields` with `{key: value}`, as a JSON object
pub(crate) fn object_with<T: Serialize>(key: &str, value: &str, fields: &T) -> Result<Value> {
    let mut object = Map::new();
    object.insert(key.to_string(), Value::String(value.to_string()));
    match serde_json::to_value(fields)? {
        Value::Object(rest) => object.extend(rest),
        Value::Null => {}
        other => {
            return Err(MeshError::unexpected(format!(
                "expected an object payload, got {other}"
            )))
        }
    }
    Ok(Value::Object(object))
}

impl Mesh {
    /// Route an opaque message to `user_id`
    pub async fn send_server_deliver(&self, user_id: &str, message: &OpaqueMessage) -> Result<Routed> {
        let payload = object_with("user_id", user_id, message)?;
        self.route_to_user(FrameType::ServerDeliver, user_id, payload, |payload| {
            MeshEvent::UserDelivered { payload }
        })
        .await
    }

    /// Outbound routing shared by every user-addressed frame type
    pub(crate) async fn route_to_user(
        &self,
        kind: FrameType,
        user_id: &str,
        payload: Value,
        local_event: impl FnOnce(Value) -> MeshEvent,
    ) -> Result<Routed> {
        let location = self.directory.read().await.location(user_id).cloned();
        match location {
            Some(UserLocation::Local) => {
                self.emit(local_event(payload));
                Ok(Routed::Local)
            }
            Some(UserLocation::Remote(host)) => {
                let envelope = self.build_signed(kind, &host, payload)?;
                if self.send_to_server(&host, &envelope).await {
                    debug!("{kind} for {user_id} sent to {host}");
                    Ok(Routed::Remote(host))
                } else {
                    debug!("{kind} for {user_id}: host {host} has no live link");
                    Ok(Routed::Nowhere)
                }
            }
            None => {
                debug!("{kind} for {user_id}: user unknown");
                Ok(Routed::Nowhere)
            }
        }
    }

    pub(crate) async fn on_server_deliver(
        &self,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        let Some(user_id) = envelope.payload_str("user_id") else {
            return Err(MeshError::rejected(ErrorCode::BadPayload, "missing user_id"));
        };
        let key = SeenKey::new(
            FrameType::ServerDeliver,
            &envelope.from,
            user_id,
            Discriminant::Timestamp(envelope.ts),
        );

        let delivered = self
            .route_inbound(envelope, conn, user_id, key, |payload| MeshEvent::UserDelivered {
                payload,
            })
            .await?;
        if delivered {
            conn.link.send(&self.ack_for(envelope, Some("DELIVERED"))?)?;
        }
        Ok(())
    }

    /// Inbound routing shared by every user-addressed frame type.
    ///
    /// Drops replays, delivers locally, forwards re-signed to the hosting
    /// server, or answers `USER_NOT_FOUND`. Returns true when the frame was
    /// handed to the local layer.
    pub(crate) async fn route_inbound(
        &self,
        envelope: &Envelope,
        conn: &ConnectionState,
        user_id: &str,
        key: SeenKey,
        local_event: impl FnOnce(Value) -> MeshEvent,
    ) -> Result<bool> {
        let kind = key.kind;
        let (location, host_link) = {
            let mut dir = self.directory.write().await;
            if !dir.check_and_mark(key, now_ms()) {
                debug!("Duplicate {kind} for {user_id} from {}", envelope.from);
                return Ok(false);
            }
            let location = dir.location(user_id).cloned();
            let host_link = match &location {
                Some(UserLocation::Remote(host)) => dir.link(host),
                _ => None,
            };
            (location, host_link)
        };

        match (location, host_link) {
            (Some(UserLocation::Local), _) => {
                self.emit(local_event(envelope.payload.clone()));
                Ok(true)
            }
            (Some(UserLocation::Remote(host)), Some(link)) if host != envelope.from => {
                let forward = self.build_signed(kind, &host, envelope.payload.clone())?;
                link.send(&forward)?;
                debug!("{kind} for {user_id} from {} forwarded to {host}", envelope.from);
                Ok(false)
            }
            _ => {
                info!("{kind} for unknown user {user_id} from {}", envelope.from);
                let error = self.error_for(envelope, ErrorCode::UserNotFound, user_id)?;
                conn.link.send(&error)?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::crypto::signing::test_keys;
    use crate::transport::{AckPayload, ErrorPayload};
    use serde_json::json;

    const USER: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    const SENDER: &str = "9b2f1c3d-4e5f-4a6b-8c7d-0e1f2a3b4c5d";

    fn message() -> OpaqueMessage {
        OpaqueMessage {
            ciphertext: "Y2lwaGVydGV4dA".to_string(),
            sender: Some(SENDER.to_string()),
            sender_pub: None,
            content_sig: Some("c2ln".to_string()),
        }
    }

    #[test]
    fn test_payload_skips_absent_fields() {
        let payload = object_with("user_id", USER, &message()).unwrap();
        assert_eq!(
            payload,
            json!({"user_id": USER, "ciphertext": "Y2lwaGVydGV4dA", "sender": SENDER, "content_sig": "c2ln"})
        );
    }

    #[tokio::test]
    async fn test_outbound_local_emits_event() {
        let (a, mut events_a) = node(test_keys::key_a());
        a.advertise_user(USER, json!({})).await.unwrap();

        assert_eq!(a.send_server_deliver(USER, &message()).await.unwrap(), Routed::Local);
        match &events(&mut events_a)[..] {
            [MeshEvent::UserDelivered { payload }] => assert_eq!(payload["ciphertext"], "Y2lwaGVydGV4dA"),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbound_remote_sends_signed_deliver() {
        let (a, _) = node(test_keys::key_a());
        let (b, _) = node(test_keys::key_b());
        let (_, mut rx_b) = link_to(&a, &b).await;
        a.directory
            .write()
            .await
            .set_location(USER, UserLocation::Remote(b.self_id().to_string()));

        let routed = a.send_server_deliver(USER, &message()).await.unwrap();
        assert_eq!(routed, Routed::Remote(b.self_id().to_string()));

        let sent = drain_kind(&mut rx_b, FrameType::ServerDeliver);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, b.self_id());
        know(&b, &a).await;
        assert_eq!(b.verify_incoming(&sent[0], None).await, Ok(()));
    }

    #[tokio::test]
    async fn test_outbound_unknown_is_nowhere() {
        let (a, mut events_a) = node(test_keys::key_a());
        assert_eq!(a.send_server_deliver(USER, &message()).await.unwrap(), Routed::Nowhere);

        a.directory
            .write()
            .await
            .set_location(USER, UserLocation::Remote("unlinked".into()));
        assert_eq!(a.send_server_deliver(USER, &message()).await.unwrap(), Routed::Nowhere);
        assert!(events(&mut events_a).is_empty());
    }

    #[tokio::test]
    async fn test_inbound_local_delivers_once_and_acks() {
        let (a, _) = node(test_keys::key_a());
        let (b, mut events_b) = node(test_keys::key_b());
        know(&b, &a).await;
        b.advertise_user(USER, json!({})).await.unwrap();
        let (mut conn, mut rx) = linked_conn(&b);

        let payload = object_with("user_id", USER, &message()).unwrap();
        let deliver = signed_by(&a, FrameType::ServerDeliver, b.self_id(), payload.clone());
        let text = deliver.to_json().unwrap();
        b.process_frame(&mut conn, &text).await;
        b.process_frame(&mut conn, &text).await;

        assert_eq!(events(&mut events_b), vec![MeshEvent::UserDelivered { payload }]);
        let acks = drain_kind(&mut rx, FrameType::Ack);
        assert_eq!(acks.len(), 1);
        let ack: AckPayload = acks[0].payload_as().unwrap();
        assert_eq!(ack.reference, deliver.reference());
        assert_eq!(ack.status.as_deref(), Some("DELIVERED"));
    }

    #[tokio::test]
    async fn test_inbound_unknown_user_gets_one_error() {
        let [(a, _), (b, mut events_b), (c, _)] = nodes3();
        know(&b, &a).await;
        let (_, mut rx_c) = link_to(&b, &c).await;
        let (mut conn, mut rx) = linked_conn(&b);

        let deliver = signed_by(
            &a,
            FrameType::ServerDeliver,
            b.self_id(),
            object_with("user_id", USER, &message()).unwrap(),
        );
        b.process_frame(&mut conn, &deliver.to_json().unwrap()).await;

        let errors = drain_kind(&mut rx, FrameType::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to, a.self_id());
        let error: ErrorPayload = errors[0].payload_as().unwrap();
        assert_eq!(error.code, ErrorCode::UserNotFound);
        assert!(drain(&mut rx_c).is_empty());
        assert!(events(&mut events_b).is_empty());
    }

    #[tokio::test]
    async fn test_inbound_remote_forwards_resigned() {
        let [(a, _), (b, _), (c, _)] = nodes3();
        know(&b, &a).await;
        let (_, mut rx_c) = link_to(&b, &c).await;
        b.directory
            .write()
            .await
            .set_location(USER, UserLocation::Remote(c.self_id().to_string()));
        let (mut conn, _rx) = linked_conn(&b);

        let payload = object_with("user_id", USER, &message()).unwrap();
        let deliver = signed_by(&a, FrameType::ServerDeliver, b.self_id(), payload.clone());
        b.process_frame(&mut conn, &deliver.to_json().unwrap()).await;

        let forwarded = drain_kind(&mut rx_c, FrameType::ServerDeliver);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].from, b.self_id());
        assert_eq!(forwarded[0].to, c.self_id());
        assert_eq!(forwarded[0].payload, payload);
        know(&c, &b).await;
        assert_eq!(c.verify_incoming(&forwarded[0], None).await, Ok(()));
    }

    #[tokio::test]
    async fn test_inbound_mapped_to_sender_is_not_bounced() {
        let (a, _) = node(test_keys::key_a());
        let (b, _) = node(test_keys::key_b());
        let (_, mut rx_a) = link_to(&b, &a).await;
        b.directory
            .write()
            .await
            .set_location(USER, UserLocation::Remote(a.self_id().to_string()));
        let (mut conn, mut rx) = linked_conn(&b);

        let deliver = signed_by(
            &a,
            FrameType::ServerDeliver,
            b.self_id(),
            object_with("user_id", USER, &message()).unwrap(),
        );
        b.process_frame(&mut conn, &deliver.to_json().unwrap()).await;

        assert!(drain_kind(&mut rx_a, FrameType::ServerDeliver).is_empty());
        assert_eq!(drain_kind(&mut rx, FrameType::Error).len(), 1);
    }
}
