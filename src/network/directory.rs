//! Shared mesh state: links, peer addresses, user locations, the replay cache
//! and last-seen timestamps.
//!
//! The directory itself is plain data; [`crate::network::Mesh`] owns it
//! behind one `RwLock` so every mutation is linearizable.

use crate::transport::{FrameType, PeerInfo, PeerLink};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Where a user is hosted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLocation {
    /// On this server
    Local,
    /// On the server with this id
    Remote(String),
}

/// A registered live link
#[derive(Debug, Clone)]
pub struct LinkEntry {
    /// Send handle
    pub link: Arc<PeerLink>,
    /// Peer URL, when known
    pub url: Option<String>,
    /// Peer public key, when known
    pub pubkey_b64url: Option<String>,
}

/// Last-known address of a peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAddress {
    /// Listening URL
    pub url: Option<String>,
    /// Public key in transport form
    pub pubkey_b64url: Option<String>,
}

/// What distinguishes otherwise identical fingerprints
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Discriminant {
    /// Nothing beyond type, origin and subject
    None,
    /// Envelope timestamp
    Timestamp(i64),
    /// File chunk index
    Chunk(u64),
    /// Timestamp plus a bounded prefix of the content
    TimestampPrefix(i64, String),
}

/// Replay/loop suppression key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeenKey {
    /// Frame type
    pub kind: FrameType,
    /// Originating server
    pub origin: String,
    /// User or file the frame is about
    pub subject: String,
    /// Extra distinguishing data
    pub discriminant: Discriminant,
}

impl SeenKey {
    /// Build a key
    pub fn new(
        kind: FrameType,
        origin: impl Into<String>,
        subject: impl Into<String>,
        discriminant: Discriminant,
    ) -> Self {
        Self {
            kind,
            origin: origin.into(),
            subject: subject.into(),
            discriminant,
        }
    }
}

/// Diagnostic view of the directory
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DirectorySnapshot {
    /// Server ids with a live link, sorted
    pub linked_peers: Vec<String>,
    /// Peers with an address record
    pub known_peers: usize,
    /// Users hosted here
    pub local_users: usize,
    /// Users hosted elsewhere
    pub remote_users: usize,
    /// Entries in the replay cache
    pub seen_entries: usize,
}

/// All mesh state in one place
#[derive(Debug)]
pub struct MeshDirectory {
    links: HashMap<String, LinkEntry>,
    addresses: HashMap<String, PeerAddress>,
    user_locations: HashMap<String, UserLocation>,
    seen: HashMap<SeenKey, i64>,
    last_seen: HashMap<String, i64>,
    dialing: HashSet<String>,
    seen_ttl_ms: i64,
}

impl MeshDirectory {
    /// Empty directory with the given replay TTL
    pub fn new(seen_ttl_ms: i64) -> Self {
        Self {
            links: HashMap::new(),
            addresses: HashMap::new(),
            user_locations: HashMap::new(),
            seen: HashMap::new(),
            last_seen: HashMap::new(),
            dialing: HashSet::new(),
            seen_ttl_ms,
        }
    }

    // --- links ---

    /// Register `link` under `server_id`, returning any link it replaced.
    ///
    /// A new link counts as evidence of life, so last-seen is stamped.
    pub fn register_link(
        &mut self,
        server_id: &str,
        link: Arc<PeerLink>,
        url: Option<String>,
        pubkey_b64url: Option<String>,
        now_ms: i64,
    ) -> Option<Arc<PeerLink>> {
        let address = self.addresses.get(server_id);
        let url = url.or_else(|| address.and_then(|a| a.url.clone()));
        let pubkey_b64url = pubkey_b64url.or_else(|| address.and_then(|a| a.pubkey_b64url.clone()));

        let previous = self.links.insert(
            server_id.to_string(),
            LinkEntry {
                link: link.clone(),
                url,
                pubkey_b64url,
            },
        );

        match previous {
            Some(entry) if entry.link.id() == link.id() => None,
            Some(entry) => {
                self.last_seen.insert(server_id.to_string(), now_ms);
                Some(entry.link)
            }
            None => {
                self.last_seen.insert(server_id.to_string(), now_ms);
                None
            }
        }
    }

    /// Send handle for a server
    pub fn link(&self, server_id: &str) -> Option<Arc<PeerLink>> {
        self.links.get(server_id).map(|e| e.link.clone())
    }

    /// Registered entry for a server
    pub fn link_entry(&self, server_id: &str) -> Option<&LinkEntry> {
        self.links.get(server_id)
    }

    /// Whether a live link to `server_id` is registered
    pub fn has_link(&self, server_id: &str) -> bool {
        self.links.contains_key(server_id)
    }

    /// Whether any registered link is known under `url`
    pub fn has_link_to_url(&self, url: &str) -> bool {
        self.links
            .values()
            .any(|e| e.url.as_deref() == Some(url) || e.link.dialed_url() == Some(url))
    }

    /// Ids of all linked servers
    pub fn linked_ids(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    /// Links to every server except `except_server`, skipping link `except_link`
    pub fn links_except(
        &self,
        except_server: Option<&str>,
        except_link: Option<u64>,
    ) -> Vec<(String, Arc<PeerLink>)> {
        self.links
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != except_server)
            .filter(|(_, e)| Some(e.link.id()) != except_link)
            .map(|(id, e)| (id.clone(), e.link.clone()))
            .collect()
    }

    /// Drop every registration that uses link `link_id`
    pub fn remove_link(&mut self, link_id: u64) -> Vec<String> {
        let ids: Vec<String> = self
            .links
            .iter()
            .filter(|(_, e)| e.link.id() == link_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.links.remove(id);
            self.last_seen.remove(id);
        }
        ids
    }

    /// Drop the registration for `server_id`
    pub fn remove_server(&mut self, server_id: &str) -> Option<LinkEntry> {
        let entry = self.links.remove(server_id)?;
        self.last_seen.remove(server_id);
        Some(entry)
    }

    /// Mark a dial as in flight; false if one already is
    pub fn begin_dial(&mut self, url: &str) -> bool {
        self.dialing.insert(url.to_string())
    }

    /// Clear an in-flight dial
    pub fn finish_dial(&mut self, url: &str) {
        self.dialing.remove(url);
    }

    // --- peer addresses ---

    /// Merge newly learned, non-empty fields into a peer's address record
    /// and refresh the live link's cached copy.
    pub fn remember_peer(&mut self, server_id: &str, url: Option<&str>, pubkey_b64url: Option<&str>) {
        if server_id.is_empty() {
            return;
        }
        let url = url.filter(|u| !u.is_empty());
        let pubkey_b64url = pubkey_b64url.filter(|k| !k.is_empty());

        let record = self.addresses.entry(server_id.to_string()).or_default();
        if let Some(url) = url {
            record.url = Some(url.to_string());
        }
        if let Some(key) = pubkey_b64url {
            record.pubkey_b64url = Some(key.to_string());
        }

        if let Some(entry) = self.links.get_mut(server_id) {
            if let Some(url) = url {
                entry.url = Some(url.to_string());
            }
            if let Some(key) = pubkey_b64url {
                entry.pubkey_b64url = Some(key.to_string());
            }
        }
    }

    /// Address record for a peer
    pub fn address(&self, server_id: &str) -> Option<&PeerAddress> {
        self.addresses.get(server_id)
    }

    /// Best known key for a peer, preferring the live link's copy
    pub fn peer_key(&self, server_id: &str) -> Option<String> {
        self.links
            .get(server_id)
            .and_then(|e| e.pubkey_b64url.clone())
            .or_else(|| {
                self.addresses
                    .get(server_id)
                    .and_then(|a| a.pubkey_b64url.clone())
            })
    }

    /// Every peer with a URL on file, excluding the given ids
    pub fn known_peers(&self, exclude: &[&str]) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .addresses
            .iter()
            .filter(|(id, _)| !exclude.contains(&id.as_str()))
            .filter_map(|(id, a)| {
                a.url.as_ref().map(|url| PeerInfo {
                    server_id: id.clone(),
                    url: url.clone(),
                    pubkey_b64url: a.pubkey_b64url.clone(),
                })
            })
            .collect();
        peers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        peers
    }

    // --- user locations ---

    /// Where a user is hosted
    pub fn location(&self, user_id: &str) -> Option<&UserLocation> {
        self.user_locations.get(user_id)
    }

    /// Record where a user is hosted
    pub fn set_location(&mut self, user_id: &str, location: UserLocation) {
        self.user_locations.insert(user_id.to_string(), location);
    }

    /// Clear a mapping only if it currently equals `expected`
    pub fn remove_location_if(&mut self, user_id: &str, expected: &UserLocation) -> bool {
        if self.user_locations.get(user_id) == Some(expected) {
            self.user_locations.remove(user_id);
            true
        } else {
            false
        }
    }

    // --- replay cache ---

    /// Record a fingerprint. Returns true the first time it is seen within
    /// the TTL, false for a repeat.
    pub fn check_and_mark(&mut self, key: SeenKey, now_ms: i64) -> bool {
        match self.seen.get(&key) {
            Some(&expiry) if expiry > now_ms => false,
            _ => {
                self.seen.insert(key, now_ms + self.seen_ttl_ms);
                true
            }
        }
    }

    /// Drop expired fingerprints
    pub fn purge_seen(&mut self, now_ms: i64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, expiry| *expiry > now_ms);
        before - self.seen.len()
    }

    // --- liveness ---

    /// Refresh a peer's last-seen time
    pub fn touch(&mut self, server_id: &str, now_ms: i64) {
        if !server_id.is_empty() {
            self.last_seen.insert(server_id.to_string(), now_ms);
        }
    }

    /// When a peer was last heard from
    pub fn last_seen(&self, server_id: &str) -> Option<i64> {
        self.last_seen.get(server_id).copied()
    }

    /// Forget last-seen stamps of servers without a link
    pub fn prune_last_seen(&mut self) -> usize {
        let before = self.last_seen.len();
        let links = &self.links;
        self.last_seen.retain(|id, _| links.contains_key(id));
        before - self.last_seen.len()
    }

    /// Linked servers silent for longer than `threshold_ms`
    pub fn stale_links(&self, now_ms: i64, threshold_ms: i64) -> Vec<String> {
        self.links
            .keys()
            .filter(|id| now_ms - self.last_seen.get(*id).copied().unwrap_or(0) > threshold_ms)
            .cloned()
            .collect()
    }

    /// Diagnostic counters
    pub fn snapshot(&self) -> DirectorySnapshot {
        let mut linked_peers = self.linked_ids();
        linked_peers.sort();
        let local_users = self
            .user_locations
            .values()
            .filter(|l| **l == UserLocation::Local)
            .count();

        DirectorySnapshot {
            linked_peers,
            known_peers: self.addresses.len(),
            local_users,
            remote_users: self.user_locations.len() - local_users,
            seen_entries: self.seen.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: u64, url: Option<&str>) -> Arc<PeerLink> {
        PeerLink::channel(id, url.map(str::to_string)).0
    }

    #[test]
    fn test_register_and_remove_by_link_id() {
        let mut dir = MeshDirectory::new(90_000);
        let shared = link(1, None);
        dir.register_link("a", shared.clone(), None, None, 10);
        dir.register_link("b", link(2, None), None, None, 10);

        assert!(dir.has_link("a"));
        assert_eq!(dir.last_seen("a"), Some(10));
        assert_eq!(dir.remove_link(1), vec!["a".to_string()]);
        assert!(!dir.has_link("a"));
        assert!(dir.has_link("b"));
    }

    #[test]
    fn test_unlinking_forgets_last_seen() {
        let mut dir = MeshDirectory::new(90_000);
        dir.register_link("a", link(1, None), None, None, 10);
        dir.register_link("b", link(2, None), None, None, 10);
        dir.touch("stranger", 15);

        dir.remove_link(1);
        assert_eq!(dir.last_seen("a"), None);
        assert!(dir.remove_server("b").is_some());
        assert_eq!(dir.last_seen("b"), None);

        assert_eq!(dir.prune_last_seen(), 1);
        assert_eq!(dir.last_seen("stranger"), None);
    }

    #[test]
    fn test_register_replacement_returns_old_link() {
        let mut dir = MeshDirectory::new(90_000);
        assert!(dir.register_link("a", link(1, None), None, None, 0).is_none());
        let old = dir.register_link("a", link(2, None), None, None, 50).unwrap();
        assert_eq!(old.id(), 1);
        assert_eq!(dir.last_seen("a"), Some(50));

        // The old link closing must not unregister the new one.
        assert!(dir.remove_link(1).is_empty());
        assert!(dir.has_link("a"));
    }

    #[test]
    fn test_re_registering_same_link_keeps_last_seen() {
        let mut dir = MeshDirectory::new(90_000);
        let l = link(1, None);
        dir.register_link("a", l.clone(), None, None, 0);
        dir.touch("a", 20);
        dir.register_link("a", l, Some("ws://a".into()), None, 30);
        assert_eq!(dir.last_seen("a"), Some(20));
        assert_eq!(dir.link_entry("a").unwrap().url.as_deref(), Some("ws://a"));
    }

    #[test]
    fn test_remember_peer_merges_non_null_fields() {
        let mut dir = MeshDirectory::new(90_000);
        dir.remember_peer("a", Some("ws://a:1"), None);
        dir.remember_peer("a", None, Some("KEY"));
        dir.remember_peer("a", Some(""), None);

        let record = dir.address("a").unwrap();
        assert_eq!(record.url.as_deref(), Some("ws://a:1"));
        assert_eq!(record.pubkey_b64url.as_deref(), Some("KEY"));

        dir.register_link("a", link(1, None), None, None, 0);
        assert_eq!(dir.link_entry("a").unwrap().url.as_deref(), Some("ws://a:1"));

        dir.remember_peer("a", None, Some("KEY2"));
        assert_eq!(dir.peer_key("a").as_deref(), Some("KEY2"));
    }

    #[test]
    fn test_peer_key_prefers_live_link() {
        let mut dir = MeshDirectory::new(90_000);
        dir.remember_peer("a", None, Some("ADDR"));
        dir.register_link("a", link(1, None), None, Some("LINK".into()), 0);
        assert_eq!(dir.peer_key("a").as_deref(), Some("LINK"));
        assert_eq!(dir.peer_key("zzz"), None);
    }

    #[test]
    fn test_has_link_to_url() {
        let mut dir = MeshDirectory::new(90_000);
        dir.register_link("a", link(1, Some("ws://dialed")), None, None, 0);
        dir.register_link("b", link(2, None), Some("ws://advertised".into()), None, 0);
        assert!(dir.has_link_to_url("ws://dialed"));
        assert!(dir.has_link_to_url("ws://advertised"));
        assert!(!dir.has_link_to_url("ws://other"));
    }

    #[test]
    fn test_links_except() {
        let mut dir = MeshDirectory::new(90_000);
        dir.register_link("a", link(1, None), None, None, 0);
        dir.register_link("b", link(2, None), None, None, 0);
        dir.register_link("c", link(3, None), None, None, 0);

        let mut ids: Vec<String> = dir
            .links_except(Some("a"), Some(3))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["b".to_string()]);
        assert_eq!(dir.links_except(None, None).len(), 3);
    }

    #[test]
    fn test_location_removal_is_conditional() {
        let mut dir = MeshDirectory::new(90_000);
        dir.set_location("u", UserLocation::Remote("a".into()));
        assert!(!dir.remove_location_if("u", &UserLocation::Remote("b".into())));
        assert_eq!(dir.location("u"), Some(&UserLocation::Remote("a".into())));
        assert!(dir.remove_location_if("u", &UserLocation::Remote("a".into())));
        assert_eq!(dir.location("u"), None);
    }

    #[test]
    fn test_seen_cache_ttl() {
        let mut dir = MeshDirectory::new(1_000);
        let key = SeenKey::new(FrameType::UserAdvertise, "a", "u", Discriminant::Timestamp(5));

        assert!(dir.check_and_mark(key.clone(), 0));
        assert!(!dir.check_and_mark(key.clone(), 999));
        assert!(dir.check_and_mark(key.clone(), 1_000));

        let chunk0 = SeenKey::new(FrameType::FileChunk, "a", "f", Discriminant::Chunk(0));
        let chunk1 = SeenKey::new(FrameType::FileChunk, "a", "f", Discriminant::Chunk(1));
        assert!(dir.check_and_mark(chunk0, 0));
        assert!(dir.check_and_mark(chunk1, 0));

        assert_eq!(dir.purge_seen(5_000), 3);
        assert_eq!(dir.snapshot().seen_entries, 0);
    }

    #[test]
    fn test_structured_key_avoids_delimiter_collisions() {
        let mut dir = MeshDirectory::new(90_000);
        let a = SeenKey::new(FrameType::UserAdvertise, "x|y", "z", Discriminant::Timestamp(1));
        let b = SeenKey::new(FrameType::UserAdvertise, "x", "y|z", Discriminant::Timestamp(1));
        assert!(dir.check_and_mark(a, 0));
        assert!(dir.check_and_mark(b, 0));
    }

    #[test]
    fn test_stale_links() {
        let mut dir = MeshDirectory::new(90_000);
        dir.register_link("old", link(1, None), None, None, 0);
        dir.register_link("fresh", link(2, None), None, None, 0);
        dir.touch("fresh", 40_000);

        assert_eq!(dir.stale_links(46_000, 45_000), vec!["old".to_string()]);
        assert!(dir.stale_links(45_000, 45_000).is_empty());
    }

    #[test]
    fn test_known_peers_and_snapshot() {
        let mut dir = MeshDirectory::new(90_000);
        dir.remember_peer("b", Some("ws://b"), Some("KB"));
        dir.remember_peer("a", Some("ws://a"), None);
        dir.remember_peer("nourl", None, Some("K"));
        dir.set_location("u1", UserLocation::Local);
        dir.set_location("u2", UserLocation::Remote("b".into()));
        dir.register_link("b", link(1, None), None, None, 0);

        let peers = dir.known_peers(&["a"]);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].server_id, "b");
        assert_eq!(peers[0].pubkey_b64url.as_deref(), Some("KB"));

        let snap = dir.snapshot();
        assert_eq!(snap.linked_peers, vec!["b".to_string()]);
        assert_eq!(snap.known_peers, 3);
        assert_eq!(snap.local_users, 1);
        assert_eq!(snap.remote_users, 1);
    }

    #[test]
    fn test_dial_dedup() {
        let mut dir = MeshDirectory::new(90_000);
        assert!(dir.begin_dial("ws://a"));
        assert!(!dir.begin_dial("ws://a"));
        dir.finish_dial("ws://a");
        assert!(dir.begin_dial("ws://a"));
    }
}
