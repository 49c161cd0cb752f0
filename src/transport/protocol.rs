//! Wire protocol definitions for mesh envelopes.
//!
//! Every frame exchanged between servers is one UTF-8 JSON [`Envelope`]. The
//! `type` tag comes from the closed [`FrameType`] vocabulary; the `payload`
//! is type-specific and signed on its own (see [`crate::crypto::signing`]).

use crate::utils::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// `to` marker for frames addressed to every peer
pub const BROADCAST: &str = "*";

/// Closed vocabulary of frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    /// New server asking an introducer to join
    ServerHelloJoin,
    /// Introducer's reply listing current peers
    ServerWelcome,
    /// Server broadcasting its id, URL and key
    ServerAnnounce,
    /// First frame on a direct peer link
    ServerHelloLink,
    /// A user is now hosted by the sender
    UserAdvertise,
    /// A user left the sender
    UserRemove,
    /// Opaque message for a user
    ServerDeliver,
    /// Network-wide public channel message
    MsgPublicChannel,
    /// Public channel membership added
    PublicChannelAdd,
    /// Public channel metadata changed
    PublicChannelUpdated,
    /// Wrapped public channel key for one user
    PublicChannelKeyShare,
    /// File transfer start
    FileStart,
    /// File transfer chunk
    FileChunk,
    /// File transfer end
    FileEnd,
    /// Liveness beacon
    Heartbeat,
    /// Positive acknowledgement
    Ack,
    /// Error reply
    Error,
}

impl FrameType {
    /// Every frame type, in protocol order
    pub const ALL: [FrameType; 17] = [
        Self::ServerHelloJoin,
        Self::ServerWelcome,
        Self::ServerAnnounce,
        Self::ServerHelloLink,
        Self::UserAdvertise,
        Self::UserRemove,
        Self::ServerDeliver,
        Self::MsgPublicChannel,
        Self::PublicChannelAdd,
        Self::PublicChannelUpdated,
        Self::PublicChannelKeyShare,
        Self::FileStart,
        Self::FileChunk,
        Self::FileEnd,
        Self::Heartbeat,
        Self::Ack,
        Self::Error,
    ];

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerHelloJoin => "SERVER_HELLO_JOIN",
            Self::ServerWelcome => "SERVER_WELCOME",
            Self::ServerAnnounce => "SERVER_ANNOUNCE",
            Self::ServerHelloLink => "SERVER_HELLO_LINK",
            Self::UserAdvertise => "USER_ADVERTISE",
            Self::UserRemove => "USER_REMOVE",
            Self::ServerDeliver => "SERVER_DELIVER",
            Self::MsgPublicChannel => "MSG_PUBLIC_CHANNEL",
            Self::PublicChannelAdd => "PUBLIC_CHANNEL_ADD",
            Self::PublicChannelUpdated => "PUBLIC_CHANNEL_UPDATED",
            Self::PublicChannelKeyShare => "PUBLIC_CHANNEL_KEY_SHARE",
            Self::FileStart => "FILE_START",
            Self::FileChunk => "FILE_CHUNK",
            Self::FileEnd => "FILE_END",
            Self::Heartbeat => "HEARTBEAT",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        }
    }

    /// Types that may arrive unsigned from a server whose key is unknown
    pub fn is_bootstrap(self) -> bool {
        matches!(
            self,
            Self::ServerHelloJoin | Self::ServerHelloLink | Self::ServerAnnounce
        )
    }

    /// Types that may open an inbound connection
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::ServerHelloJoin | Self::ServerHelloLink)
    }
}

impl FromStr for FrameType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::InvalidMessage {
                reason: format!("unknown frame type {s}"),
            })
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codes carried by `ERROR` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Sender's key is unknown and the type is not a bootstrap type
    UnknownPeerKey,
    /// Key known but no signature present
    MissingSig,
    /// Signature does not verify
    InvalidSig,
    /// `ts` outside the clock-skew window
    BadTimestamp,
    /// Envelope or payload failed validation
    BadPayload,
    /// Connection exceeded its frame budget
    RateLimit,
    /// `type` outside the vocabulary
    UnknownType,
    /// No route to the destination user
    UserNotFound,
}

impl ErrorCode {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownPeerKey => "UNKNOWN_PEER_KEY",
            Self::MissingSig => "MISSING_SIG",
            Self::InvalidSig => "INVALID_SIG",
            Self::BadTimestamp => "BAD_TIMESTAMP",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::RateLimit => "RATE_LIMIT",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::UserNotFound => "USER_NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of wire exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame type tag; kept as text so unknown types can still be answered
    #[serde(rename = "type")]
    pub kind: String,
    /// Sending server id
    #[serde(default)]
    pub from: String,
    /// Destination server id, user id or [`BROADCAST`]
    #[serde(default)]
    pub to: String,
    /// Milliseconds since the Unix epoch
    pub ts: i64,
    /// Type-specific payload
    pub payload: Value,
    /// Base64url RSA-PSS signature over the canonical payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Envelope {
    /// Parse a text frame; `None` if it does not look like an envelope at all
    pub fn parse(text: &str) -> Option<Self> {
        let envelope: Self = serde_json::from_str(text).ok()?;
        envelope.payload.is_object().then_some(envelope)
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// The frame type, if it is in the vocabulary
    pub fn frame_type(&self) -> Option<FrameType> {
        self.kind.parse().ok()
    }

    /// Reference used by `ACK`/`ERROR` replies
    pub fn reference(&self) -> FrameRef {
        FrameRef {
            kind: self.kind.clone(),
            from: self.from.clone(),
            ts: self.ts,
        }
    }

    /// Decode the payload into a typed structure
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProtocolError::InvalidMessage {
                reason: format!("{} payload: {e}", self.kind),
            }
            .into()
        })
    }

    /// A string field of the payload
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

/// Identifies the frame an `ACK` or `ERROR` answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    /// Referenced frame type
    #[serde(rename = "type")]
    pub kind: String,
    /// Referenced frame sender
    #[serde(default)]
    pub from: String,
    /// Referenced frame timestamp
    pub ts: i64,
}

/// `SERVER_HELLO_JOIN` / `SERVER_HELLO_LINK` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// URL the sender listens on
    pub url: String,
    /// Sender's public key in transport form
    pub pubkey_b64url: String,
}

/// A peer as listed in welcomes and announcements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer server id
    pub server_id: String,
    /// Peer listening URL
    pub url: String,
    /// Peer public key, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey_b64url: Option<String>,
}

/// `SERVER_ANNOUNCE` payload
pub type AnnouncePayload = PeerInfo;

/// `SERVER_WELCOME` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomePayload {
    /// Id the introducer recorded for the joiner
    pub assigned_id: String,
    /// Other known mesh members
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

/// `USER_ADVERTISE` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisePayload {
    /// Advertised user
    pub user_id: String,
    /// Server the origin claims hosts the user (informational)
    #[serde(default)]
    pub server_id: String,
    /// Optional display fields; never used for routing
    #[serde(default)]
    pub meta: Value,
}

/// `USER_REMOVE` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePayload {
    /// Removed user
    pub user_id: String,
    /// Server the origin claims hosted the user (informational)
    #[serde(default)]
    pub server_id: String,
}

/// `ERROR` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Offending frame
    #[serde(rename = "ref")]
    pub reference: FrameRef,
    /// Error code
    pub code: ErrorCode,
    /// Human-readable detail
    #[serde(default)]
    pub detail: String,
}

/// `ACK` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Acknowledged frame
    #[serde(rename = "ref")]
    pub reference: FrameRef,
    /// Outcome, e.g. `DELIVERED`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}
