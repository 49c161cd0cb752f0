//! Peer link management: dialing, joining through introducers and
//! announcing ourselves.

use super::Mesh;
use crate::transport::{ws, FrameType, BROADCAST, CLOSE_GOING_AWAY};
use crate::utils::Result;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

impl Mesh {
    /// `{url, pubkey_b64url}` hello body
    fn hello_payload(&self) -> Value {
        json!({ "url": self.self_url(), "pubkey_b64url": self.identity().public_b64url() })
    }

    /// Open a link to `url` and say hello.
    ///
    /// With `known_id` the link is registered right away so sends can start
    /// before the peer's own hello arrives. Returns false when the dial was
    /// skipped: our own URL, an existing link, or a dial already in flight.
    pub async fn connect_peer(self: &Arc<Self>, url: &str, known_id: Option<&str>) -> Result<bool> {
        if url == self.self_url() {
            return Ok(false);
        }
        {
            let mut dir = self.directory.write().await;
            if dir.has_link_to_url(url) {
                debug!("Already linked to {url}");
                return Ok(false);
            }
            if !dir.begin_dial(url) {
                debug!("Dial to {url} already in flight");
                return Ok(false);
            }
        }

        let dialed = ws::dial(self, url, None).await;
        self.directory.write().await.finish_dial(url);
        let link = dialed?;

        if let Some(server_id) = known_id {
            self.register_link(server_id, link.clone(), Some(url.to_string()), None)
                .await;
        }
        let hello = self.build_signed(
            FrameType::ServerHelloLink,
            known_id.unwrap_or(url),
            self.hello_payload(),
        )?;
        link.send(&hello)?;
        info!("Dialed {url} (link {})", link.id());
        Ok(true)
    }

    /// Dial in the background, logging failures
    pub(crate) fn spawn_connect(self: &Arc<Self>, url: String, known_id: Option<String>) {
        tokio::spawn(connect_task(Arc::clone(self), url, known_id));
    }

    /// Join the mesh through every configured introducer.
    ///
    /// Returns the number of introducers a join hello was sent to.
    pub async fn bootstrap_introducers(self: &Arc<Self>) -> usize {
        let mut joined = 0;
        for introducer in &self.config().network.introducers {
            if introducer.url == self.self_url() {
                continue;
            }
            match self
                .join_via(&introducer.url, introducer.pubkey_b64url.clone())
                .await
            {
                Ok(()) => joined += 1,
                Err(e) => warn!("Could not join via {}: {e}", introducer.url),
            }
        }
        joined
    }

    async fn join_via(self: &Arc<Self>, url: &str, key_hint: Option<String>) -> Result<()> {
        let link = ws::dial(self, url, key_hint).await?;
        let join = self.build_signed(FrameType::ServerHelloJoin, url, self.hello_payload())?;
        link.send(&join)?;
        info!("Sent SERVER_HELLO_JOIN to introducer {url}");
        Ok(())
    }

    /// Tell every linked server our id, URL and key
    pub async fn announce_self(&self) -> Result<usize> {
        let announce = self.build_signed(
            FrameType::ServerAnnounce,
            BROADCAST,
            json!({
                "server_id": self.self_id(),
                "url": self.self_url(),
                "pubkey_b64url": self.identity().public_b64url(),
            }),
        )?;
        let sent = self.send_to_all_peers(&announce, None, None).await;
        debug!("Announced self to {sent} peer(s)");
        Ok(sent)
    }

    /// Close every registered link
    pub async fn close_all_links(&self, reason: &str) -> usize {
        let links = self.directory.read().await.links_except(None, None);
        for (_, link) in &links {
            link.close(CLOSE_GOING_AWAY, reason);
        }
        links.len()
    }
}

// Boxed: dialing leads back into frame dispatch, which dials again.
fn connect_task(mesh: Arc<Mesh>, url: String, known_id: Option<String>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(e) = mesh.connect_peer(&url, known_id.as_deref()).await {
            warn!("Connect to {url} failed: {e}");
        }
    })
}
