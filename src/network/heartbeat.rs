//! Heartbeats and the liveness monitor.

use super::{now_ms, Mesh};
use crate::transport::{FrameType, BROADCAST, CLOSE_GOING_AWAY};
use crate::utils::Result;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shortest heartbeat period honoured
const MIN_HEARTBEAT_MS: u64 = 1000;
/// Shortest liveness threshold honoured
const MIN_PEER_DEAD_MS: u64 = 3000;

/// A link the liveness monitor closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// Silent server
    pub server_id: String,
    /// Where a reconnect was attempted, if a URL was on file
    pub reconnect_url: Option<String>,
}

/// Background heartbeat and sweep tasks
#[derive(Debug)]
pub struct LivenessTasks {
    heartbeat: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl LivenessTasks {
    /// Stop both timers
    pub fn stop(self) {
        self.heartbeat.abort();
        self.monitor.abort();
    }
}

impl Mesh {
    /// Effective liveness threshold
    pub fn peer_dead_ms(&self) -> i64 {
        let ms = self.config().liveness.peer_dead_ms.max(MIN_PEER_DEAD_MS);
        i64::try_from(ms).unwrap_or(i64::MAX)
    }

    /// Send a signed heartbeat to every linked server
    pub async fn send_heartbeats(&self) -> Result<usize> {
        let heartbeat = self.build_signed(FrameType::Heartbeat, BROADCAST, json!({}))?;
        Ok(self.send_to_all_peers(&heartbeat, None, None).await)
    }

    /// Close and forget links silent for longer than the threshold, and
    /// redial those with a URL on file. Also drops expired fingerprints.
    pub async fn sweep_dead_peers(self: &Arc<Self>, now: i64) -> Vec<Eviction> {
        let threshold = self.peer_dead_ms();
        let mut evicted = Vec::new();
        {
            let mut dir = self.directory.write().await;
            for server_id in dir.stale_links(now, threshold) {
                let Some(entry) = dir.remove_server(&server_id) else {
                    continue;
                };
                entry.link.close(CLOSE_GOING_AWAY, "peer dead");
                let reconnect_url = entry
                    .url
                    .clone()
                    .or_else(|| dir.address(&server_id).and_then(|a| a.url.clone()));
                evicted.push(Eviction {
                    server_id,
                    reconnect_url,
                });
            }
            let purged = dir.purge_seen(now);
            if purged > 0 {
                debug!("Purged {purged} expired fingerprint(s)");
            }
            dir.prune_last_seen();
        }

        for eviction in &evicted {
            info!(
                "Evicted silent peer {} (no frames for {threshold} ms)",
                eviction.server_id
            );
            if let Some(url) = &eviction.reconnect_url {
                self.spawn_connect(url.clone(), Some(eviction.server_id.clone()));
            }
        }
        evicted
    }

    /// Start the heartbeat and liveness timers
    pub fn start_liveness(self: &Arc<Self>) -> LivenessTasks {
        let liveness = &self.config().liveness;
        let heartbeat_every =
            Duration::from_millis(liveness.heartbeat_interval_ms.max(MIN_HEARTBEAT_MS));
        let sweep_every = Duration::from_millis(liveness.sweep_interval_ms.max(1));

        let mesh = Arc::clone(self);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = mesh.send_heartbeats().await {
                    warn!("Heartbeat failed: {e}");
                }
            }
        });

        let mesh = Arc::clone(self);
        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                mesh.sweep_dead_peers(now_ms()).await;
            }
        });

        LivenessTasks { heartbeat, monitor }
    }
}
