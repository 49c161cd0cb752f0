//! Presence gossip: which server hosts which user.

use super::directory::{Discriminant, SeenKey, UserLocation};
use super::gate::ConnectionState;
use super::{now_ms, Mesh, MeshEvent, PresenceChange};
use crate::transport::{AdvertisePayload, Envelope, FrameType, RemovePayload, BROADCAST};
use crate::utils::Result;
use log::{debug, info};
use serde_json::{json, Value};

impl Mesh {
    /// Mark `user_id` as hosted here and tell every peer.
    ///
    /// Returns the number of links the advertisement was written to.
    pub async fn advertise_user(&self, user_id: &str, meta: Value) -> Result<usize> {
        self.directory
            .write()
            .await
            .set_location(user_id, UserLocation::Local);

        let advert = self.build_signed(
            FrameType::UserAdvertise,
            BROADCAST,
            json!({ "user_id": user_id, "server_id": self.self_id(), "meta": meta }),
        )?;
        let sent = self.send_to_all_peers(&advert, None, None).await;
        info!("Advertised user {user_id} to {sent} peer(s)");
        Ok(sent)
    }

    /// Forget a local user and tell every peer
    pub async fn remove_user(&self, user_id: &str) -> Result<usize> {
        self.directory
            .write()
            .await
            .remove_location_if(user_id, &UserLocation::Local);

        let removal = self.build_signed(
            FrameType::UserRemove,
            BROADCAST,
            json!({ "user_id": user_id, "server_id": self.self_id() }),
        )?;
        let sent = self.send_to_all_peers(&removal, None, None).await;
        info!("Removed user {user_id}; told {sent} peer(s)");
        Ok(sent)
    }

    pub(crate) async fn on_user_advertise(
        &self,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        let advert: AdvertisePayload = envelope.payload_as()?;
        let key = SeenKey::new(
            FrameType::UserAdvertise,
            &envelope.from,
            &advert.user_id,
            Discriminant::Timestamp(envelope.ts),
        );

        {
            let mut dir = self.directory.write().await;
            if !dir.check_and_mark(key, now_ms()) {
                debug!("Duplicate USER_ADVERTISE for {} from {}", advert.user_id, envelope.from);
                return Ok(());
            }
            // The sender is authoritative, not whatever server_id it claims.
            dir.set_location(&advert.user_id, UserLocation::Remote(envelope.from.clone()));
        }

        debug!("User {} is on {}", advert.user_id, envelope.from);
        self.emit(MeshEvent::PresenceChanged {
            change: PresenceChange::Advertised,
            user_id: advert.user_id,
            server_id: envelope.from.clone(),
            meta: advert.meta,
        });

        self.send_to_all_peers(envelope, Some(&envelope.from), Some(conn.link.id()))
            .await;
        Ok(())
    }

    pub(crate) async fn on_user_remove(
        &self,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        let removal: RemovePayload = envelope.payload_as()?;
        let key = SeenKey::new(
            FrameType::UserRemove,
            &envelope.from,
            &removal.user_id,
            Discriminant::Timestamp(envelope.ts),
        );

        let cleared = {
            let mut dir = self.directory.write().await;
            if !dir.check_and_mark(key, now_ms()) {
                debug!("Duplicate USER_REMOVE for {} from {}", removal.user_id, envelope.from);
                return Ok(());
            }
            dir.remove_location_if(&removal.user_id, &UserLocation::Remote(envelope.from.clone()))
        };

        if !cleared {
            debug!(
                "USER_REMOVE for {} from {} left the mapping alone",
                removal.user_id, envelope.from
            );
        }
        self.emit(MeshEvent::PresenceChanged {
            change: PresenceChange::Removed,
            user_id: removal.user_id,
            server_id: envelope.from.clone(),
            meta: Value::Null,
        });

        self.send_to_all_peers(envelope, Some(&envelope.from), Some(conn.link.id()))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::crypto::signing::test_keys;

    const USER: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    #[tokio::test]
    async fn test_advertise_marks_local_and_broadcasts() {
        let [(a, _), (b, _), (c, _)] = nodes3();
        let (_, mut rx_b) = link_to(&a, &b).await;
        let (_, mut rx_c) = link_to(&a, &c).await;

        assert_eq!(a.advertise_user(USER, json!({"name": "ann"})).await.unwrap(), 2);
        assert_eq!(a.directory().await.location(USER), Some(&UserLocation::Local));

        for rx in [&mut rx_b, &mut rx_c] {
            let adverts = drain_kind(rx, FrameType::UserAdvertise);
            assert_eq!(adverts.len(), 1);
            assert_eq!(adverts[0].payload["user_id"], USER);
            assert_eq!(adverts[0].payload["server_id"], json!(a.self_id()));
        }
    }

    #[tokio::test]
    async fn test_remove_clears_only_local_mapping() {
        let (a, _) = node(test_keys::key_a());
        a.advertise_user(USER, json!({})).await.unwrap();
        a.remove_user(USER).await.unwrap();
        assert!(a.directory().await.location(USER).is_none());

        a.directory
            .write()
            .await
            .set_location(USER, UserLocation::Remote("elsewhere".into()));
        a.remove_user(USER).await.unwrap();
        assert_eq!(
            a.directory().await.location(USER),
            Some(&UserLocation::Remote("elsewhere".into()))
        );
    }

    #[tokio::test]
    async fn test_remote_advert_maps_to_sender_and_forwards() {
        let [(a, _), (b, mut events_b), (c, _)] = nodes3();
        know(&b, &a).await;
        let (_, mut rx_c) = link_to(&b, &c).await;
        let (mut conn, _rx) = linked_conn(&b);

        // The claimed server_id is ignored in favour of the sender.
        let advert = signed_by(
            &a,
            FrameType::UserAdvertise,
            BROADCAST,
            json!({"user_id": USER, "server_id": c.self_id(), "meta": {}}),
        );
        b.process_frame(&mut conn, &advert.to_json().unwrap()).await;

        assert_eq!(
            b.directory().await.location(USER),
            Some(&UserLocation::Remote(a.self_id().to_string()))
        );
        let forwarded = drain_kind(&mut rx_c, FrameType::UserAdvertise);
        assert_eq!(forwarded, vec![advert]);
        assert!(matches!(
            &events(&mut events_b)[..],
            [MeshEvent::PresenceChanged { change: PresenceChange::Advertised, .. }]
        ));
    }

    #[tokio::test]
    async fn test_duplicate_advert_has_one_effect() {
        let [(a, _), (b, mut events_b), (c, _)] = nodes3();
        know(&b, &a).await;
        let (_, mut rx_c) = link_to(&b, &c).await;
        let (mut conn, _rx) = linked_conn(&b);

        let advert = signed_by(&a, FrameType::UserAdvertise, BROADCAST, json!({"user_id": USER}));
        let text = advert.to_json().unwrap();
        b.process_frame(&mut conn, &text).await;
        b.process_frame(&mut conn, &text).await;

        assert_eq!(drain_kind(&mut rx_c, FrameType::UserAdvertise).len(), 1);
        assert_eq!(events(&mut events_b).len(), 1);
    }

    #[tokio::test]
    async fn test_advert_not_echoed_to_origin() {
        let (a, _) = node(test_keys::key_a());
        let (b, _) = node(test_keys::key_b());
        let (link_a, mut rx_a) = link_to(&b, &a).await;
        let mut conn = crate::network::ConnectionState::outbound(link_a, &b.config().limits, None);

        let advert = signed_by(&a, FrameType::UserAdvertise, BROADCAST, json!({"user_id": USER}));
        b.process_frame(&mut conn, &advert.to_json().unwrap()).await;
        assert!(drain_kind(&mut rx_a, FrameType::UserAdvertise).is_empty());
    }

    #[tokio::test]
    async fn test_remove_from_other_server_keeps_mapping() {
        let [(a, _), (b, _), (c, _)] = nodes3();
        know(&b, &a).await;
        know(&b, &c).await;
        let (mut conn, _rx) = linked_conn(&b);

        let advert = signed_by(&a, FrameType::UserAdvertise, BROADCAST, json!({"user_id": USER}));
        b.process_frame(&mut conn, &advert.to_json().unwrap()).await;

        let removal = signed_by(&c, FrameType::UserRemove, BROADCAST, json!({"user_id": USER}));
        b.process_frame(&mut conn, &removal.to_json().unwrap()).await;
        assert_eq!(
            b.directory().await.location(USER),
            Some(&UserLocation::Remote(a.self_id().to_string()))
        );

        let removal = signed_by(&a, FrameType::UserRemove, BROADCAST, json!({"user_id": USER}));
        b.process_frame(&mut conn, &removal.to_json().unwrap()).await;
        assert!(b.directory().await.location(USER).is_none());
    }

    #[tokio::test]
    async fn test_last_advertiser_wins() {
        let [(a, _), (b, _), (c, _)] = nodes3();
        know(&b, &a).await;
        know(&b, &c).await;
        let (mut conn, _rx) = linked_conn(&b);

        for from in [&a, &c] {
            let advert = signed_by(from, FrameType::UserAdvertise, BROADCAST, json!({"user_id": USER}));
            b.process_frame(&mut conn, &advert.to_json().unwrap()).await;
        }
        assert_eq!(
            b.directory().await.location(USER),
            Some(&UserLocation::Remote(c.self_id().to_string()))
        );
    }
}
