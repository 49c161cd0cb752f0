//! Inbound gate: the only path from a socket to a frame handler.
//!
//! Every text frame goes through, in order: size cap, parse, rate limit,
//! first-frame handshake, vocabulary check, signature verification,
//! envelope and payload validation, liveness refresh, and finally dispatch.

use super::validators::{validate_envelope, validate_payload, ValidationContext};
use super::{now_ms, Mesh};
use crate::transport::{
    Envelope, ErrorCode, FrameType, PeerLink, CLOSE_POLICY_VIOLATION, CLOSE_TOO_LARGE,
};
use crate::utils::LimitsConfig;
use log::{debug, warn};
use std::sync::Arc;
use tokio::time::Instant;

/// Per-connection token bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Full bucket
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    /// Take one token if available
    pub fn try_take(&mut self) -> bool {
        self.try_take_at(Instant::now())
    }

    /// Take one token as of `now`
    pub fn try_take_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;

        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

/// Connection handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No frame accepted yet
    Unauthenticated,
    /// A hello opened the connection
    Linked,
}

/// Gate state owned by one connection's reader
#[derive(Debug)]
pub struct ConnectionState {
    /// Send handle for replies
    pub link: Arc<PeerLink>,
    /// Handshake progress
    pub handshake: HandshakeState,
    /// Rate limiter
    pub bucket: TokenBucket,
    /// Key to trust for senders we know nothing about yet
    pub key_hint: Option<String>,
}

impl ConnectionState {
    /// State for a connection a peer opened to us
    pub fn inbound(link: Arc<PeerLink>, limits: &LimitsConfig) -> Self {
        Self {
            link,
            handshake: HandshakeState::Unauthenticated,
            bucket: TokenBucket::new(limits.rate_capacity, limits.rate_refill_per_sec),
            key_hint: None,
        }
    }

    /// State for a connection we dialed; our own hello opened it
    pub fn outbound(link: Arc<PeerLink>, limits: &LimitsConfig, key_hint: Option<String>) -> Self {
        Self {
            link,
            handshake: HandshakeState::Linked,
            bucket: TokenBucket::new(limits.rate_capacity, limits.rate_refill_per_sec),
            key_hint,
        }
    }
}

/// What the gate did with a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Passed every check and reached its handler
    Dispatched(FrameType),
    /// Refused with an `ERROR` reply
    Rejected(ErrorCode),
    /// Ignored without reply
    Dropped,
    /// The connection must be closed
    Close {
        /// WebSocket close code
        code: u16,
        /// Close reason
        reason: &'static str,
    },
}

impl Mesh {
    /// Run one inbound text frame through the gate
    pub async fn process_frame(self: &Arc<Self>, conn: &mut ConnectionState, text: &str) -> FrameOutcome {
        let max = self.config().network.max_frame_bytes;
        if text.len() > max {
            debug!("Frame of {} bytes exceeds {max}; closing link {}", text.len(), conn.link.id());
            return FrameOutcome::Close {
                code: CLOSE_TOO_LARGE,
                reason: "payload too large",
            };
        }

        let Some(envelope) = Envelope::parse(text) else {
            debug!("Dropping unparseable frame on link {}", conn.link.id());
            return FrameOutcome::Dropped;
        };

        if !conn.bucket.try_take() {
            return self.reject(conn, &envelope, ErrorCode::RateLimit, "too many frames");
        }

        let kind = envelope.frame_type();

        if conn.handshake == HandshakeState::Unauthenticated {
            if !kind.is_some_and(FrameType::is_handshake) {
                debug!(
                    "First frame on link {} was {}; expected a server hello",
                    conn.link.id(),
                    envelope.kind
                );
                return FrameOutcome::Close {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "Expected server hello",
                };
            }
            conn.handshake = HandshakeState::Linked;
        }

        let Some(kind) = kind else {
            return self.reject(conn, &envelope, ErrorCode::UnknownType, "Not a server message type");
        };

        if let Err(code) = self.verify_incoming(&envelope, conn.key_hint.as_deref()).await {
            return self.reject(conn, &envelope, code, "Verification failed");
        }

        let allow_dummy = self.config().security.dev_allow_dummy_keys;
        let ctx = ValidationContext {
            now_ms: now_ms(),
            skew_ms: self.config().limits.clock_skew_ms,
            allow_dummy,
        };
        if let Err(invalid) = validate_envelope(&envelope, kind, &ctx)
            .and_then(|()| validate_payload(kind, &envelope.payload, allow_dummy))
        {
            return self.reject(conn, &envelope, invalid.code, invalid.reason);
        }

        if envelope.from == self.self_id() {
            debug!("Ignoring our own {kind} echoed back on link {}", conn.link.id());
            return FrameOutcome::Dropped;
        }

        self.directory.write().await.touch(&envelope.from, now_ms());

        if let Err(e) = self.dispatch(kind, &envelope, conn).await {
            warn!("Handler for {kind} from {} failed: {e}", envelope.from);
        }
        FrameOutcome::Dispatched(kind)
    }

    /// Reply with a signed `ERROR` on the arrival link
    fn reject(&self, conn: &ConnectionState, envelope: &Envelope, code: ErrorCode, detail: &str) -> FrameOutcome {
        debug!(
            "Rejected {} from {:?} on link {}: {code} ({detail})",
            envelope.kind,
            envelope.from,
            conn.link.id()
        );
        match self.error_for(envelope, code, detail) {
            Ok(reply) => {
                if let Err(e) = conn.link.send(&reply) {
                    debug!("Could not send {code} reply: {e}");
                }
            }
            Err(e) => warn!("Could not build {code} reply: {e}"),
        }
        FrameOutcome::Rejected(code)
    }
}
