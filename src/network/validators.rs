//! Envelope and per-type payload validation.
//!
//! Checks are shape-only: payload content stays opaque, only routing fields
//! and size bounds are inspected.

use crate::crypto::DUMMY_KEY;
use crate::transport::{Envelope, ErrorCode, FrameType};
use serde_json::Value;
use uuid::Uuid;

/// Maximum URL length in bytes
pub const URL_MAX: usize = 2048;
/// Maximum public key length (base64url)
pub const PUBKEY_B64U_MAX: usize = 8192;
/// Maximum serialized user meta in bytes
pub const META_MAX_BYTES: usize = 1024;
/// Maximum file id length in bytes
pub const FILE_ID_MAX: usize = 128;
/// Maximum file name length in bytes
pub const FILE_NAME_MAX: usize = 256;
/// Maximum ciphertext length (base64url)
pub const CIPHERTEXT_B64U_MAX: usize = 256 * 1024;
/// Maximum file chunk length (base64url)
pub const FILE_CHUNK_B64U_MAX: usize = 256 * 1024;
/// Maximum serialized public channel metadata in bytes
pub const PUBLIC_META_MAX: usize = 8 * 1024;
/// Maximum content signature length (base64url)
pub const CONTENT_SIG_MAX: usize = 1024;

/// Why a frame was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalid {
    /// Wire code to reply with
    pub code: ErrorCode,
    /// Short machine-readable reason
    pub reason: &'static str,
}

impl Invalid {
    fn payload(reason: &'static str) -> Self {
        Self {
            code: ErrorCode::BadPayload,
            reason,
        }
    }
}

type Check = std::result::Result<(), Invalid>;

/// Inputs the envelope check needs besides the frame
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext {
    /// Receiver clock, ms since epoch
    pub now_ms: i64,
    /// Allowed clock skew in ms
    pub skew_ms: i64,
    /// Development mode: accept the dummy key and non-UUID hello senders
    pub allow_dummy: bool,
}

/// Hyphenated UUID version 4
pub fn is_uuid_v4(s: &str) -> bool {
    s.len() == 36
        && Uuid::parse_str(s)
            .map(|u| u.get_version_num() == 4 && u.get_variant() == uuid::Variant::RFC4122)
            .unwrap_or(false)
}

/// Non-empty unpadded base64url of at most `max` characters
pub fn is_b64url(s: &str, max: usize) -> bool {
    !s.is_empty()
        && s.len() <= max
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn is_b64url_or_dev(s: &str, max: usize, allow_dummy: bool) -> bool {
    (allow_dummy && s == DUMMY_KEY) || is_b64url(s, max)
}

fn str_field<'a>(p: &'a Value, field: &str) -> Option<&'a str> {
    p.get(field).and_then(Value::as_str)
}

fn small_str(p: &Value, field: &str, max: usize) -> bool {
    str_field(p, field).is_some_and(|s| s.len() <= max)
}

fn uuid_field(p: &Value, field: &str) -> bool {
    str_field(p, field).is_some_and(is_uuid_v4)
}

fn serialized_len(v: &Value) -> usize {
    serde_json::to_string(v).map(|s| s.len()).unwrap_or(usize::MAX)
}

/// Optional string field: absent or null passes, otherwise `ok` must hold
fn optional(p: &Value, field: &str, ok: impl Fn(&str) -> bool) -> bool {
    match p.get(field) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => ok(s),
        Some(_) => false,
    }
}

fn require(cond: bool, reason: &'static str) -> Check {
    if cond {
        Ok(())
    } else {
        Err(Invalid::payload(reason))
    }
}

/// Envelope-level checks: clock skew and sender id
pub fn validate_envelope(envelope: &Envelope, kind: FrameType, ctx: &ValidationContext) -> Check {
    if envelope.ts.abs_diff(ctx.now_ms) > ctx.skew_ms.unsigned_abs() {
        return Err(Invalid {
            code: ErrorCode::BadTimestamp,
            reason: "BAD_TIMESTAMP",
        });
    }
    if !is_uuid_v4(&envelope.from) && !(ctx.allow_dummy && kind.is_handshake()) {
        return Err(Invalid::payload("BAD_FROM"));
    }
    Ok(())
}

/// Per-type payload checks
pub fn validate_payload(kind: FrameType, p: &Value, allow_dummy: bool) -> Check {
    match kind {
        FrameType::ServerHelloJoin | FrameType::ServerHelloLink => {
            require(small_str(p, "url", URL_MAX), "BAD_URL")?;
            require(
                str_field(p, "pubkey_b64url")
                    .is_some_and(|k| is_b64url_or_dev(k, PUBKEY_B64U_MAX, allow_dummy)),
                "BAD_PUBKEY",
            )
        }

        FrameType::ServerAnnounce => {
            require(uuid_field(p, "server_id"), "BAD_SERVER_ID")?;
            require(small_str(p, "url", URL_MAX), "BAD_URL")?;
            require(
                str_field(p, "pubkey_b64url")
                    .is_some_and(|k| is_b64url_or_dev(k, PUBKEY_B64U_MAX, allow_dummy)),
                "BAD_PUBKEY",
            )
        }

        FrameType::ServerWelcome => {
            require(
                str_field(p, "assigned_id").is_some_and(|s| !s.is_empty()),
                "BAD_ASSIGNED_ID",
            )?;
            let peers = match p.get("peers") {
                None | Some(Value::Null) => return Ok(()),
                Some(Value::Array(peers)) => peers,
                Some(_) => return Err(Invalid::payload("BAD_PEERS")),
            };
            for peer in peers {
                require(uuid_field(peer, "server_id"), "BAD_SERVER_ID")?;
                require(small_str(peer, "url", URL_MAX), "BAD_URL")?;
                require(
                    optional(peer, "pubkey_b64url", |k| {
                        is_b64url_or_dev(k, PUBKEY_B64U_MAX, allow_dummy)
                    }),
                    "BAD_PUBKEY",
                )?;
            }
            Ok(())
        }

        FrameType::UserAdvertise => {
            require(uuid_field(p, "user_id"), "BAD_USER_ID")?;
            match p.get("meta") {
                Some(meta) if serialized_len(meta) > META_MAX_BYTES => {
                    Err(Invalid::payload("META_TOO_LARGE"))
                }
                _ => Ok(()),
            }
        }

        FrameType::UserRemove => require(uuid_field(p, "user_id"), "BAD_USER_ID"),

        FrameType::ServerDeliver => {
            require(uuid_field(p, "user_id"), "BAD_USER_ID")?;
            require(
                str_field(p, "ciphertext").is_some_and(|c| is_b64url(c, CIPHERTEXT_B64U_MAX)),
                "BAD_CIPHERTEXT",
            )?;
            require(optional(p, "sender", is_uuid_v4), "BAD_SENDER")?;
            require(
                optional(p, "sender_pub", |k| {
                    is_b64url_or_dev(k, PUBKEY_B64U_MAX, allow_dummy)
                }),
                "BAD_SENDER_PUB",
            )?;
            require(
                optional(p, "content_sig", |s| is_b64url(s, CONTENT_SIG_MAX)),
                "BAD_CONTENT_SIG",
            )
        }

        FrameType::FileStart => {
            require(uuid_field(p, "to_user"), "BAD_USER_ID")?;
            require(small_str(p, "file_id", FILE_ID_MAX), "BAD_FILE_ID")?;
            require(small_str(p, "name", FILE_NAME_MAX), "BAD_FILE_NAME")?;
            require(
                p.get("size")
                    .and_then(Value::as_f64)
                    .is_some_and(|s| s >= 0.0),
                "BAD_FILE_SIZE",
            )?;
            require(
                str_field(p, "sha256").is_some_and(|h| !h.is_empty()),
                "BAD_FILE_HASH",
            )
        }

        FrameType::FileChunk => {
            require(uuid_field(p, "to_user"), "BAD_USER_ID")?;
            require(small_str(p, "file_id", FILE_ID_MAX), "BAD_FILE_ID")?;
            require(p.get("index").and_then(Value::as_u64).is_some(), "BAD_CHUNK_INDEX")?;
            require(
                str_field(p, "ciphertext").is_some_and(|c| is_b64url(c, FILE_CHUNK_B64U_MAX)),
                "BAD_CHUNK",
            )
        }

        FrameType::FileEnd => {
            require(uuid_field(p, "to_user"), "BAD_USER_ID")?;
            require(small_str(p, "file_id", FILE_ID_MAX), "BAD_FILE_ID")
        }

        FrameType::MsgPublicChannel => require(
            str_field(p, "ciphertext").is_some_and(|c| is_b64url(c, CIPHERTEXT_B64U_MAX)),
            "BAD_CIPHERTEXT",
        ),

        FrameType::PublicChannelKeyShare => {
            require(uuid_field(p, "user_id"), "BAD_USER_ID")?;
            require(
                str_field(p, "wrapped_key_b64url").is_some_and(|k| is_b64url(k, PUBKEY_B64U_MAX)),
                "BAD_WRAPPED_KEY",
            )
        }

        FrameType::PublicChannelAdd | FrameType::PublicChannelUpdated => {
            require(serialized_len(p) <= PUBLIC_META_MAX, "META_TOO_LARGE")
        }

        FrameType::Heartbeat | FrameType::Ack | FrameType::Error => Ok(()),
    }
}
