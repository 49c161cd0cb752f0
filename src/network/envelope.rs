//! Envelope construction and transport-signature verification.

use super::{now_ms, Mesh};
use crate::crypto::signing::verify_payload;
use crate::transport::{
    AckPayload, Envelope, ErrorCode, ErrorPayload, FrameType,
};
use crate::utils::Result;
use serde_json::Value;

impl Mesh {
    /// Unsigned envelope from this node, stamped now
    pub fn build(&self, kind: FrameType, to: &str, payload: Value) -> Envelope {
        Envelope {
            kind: kind.as_str().to_string(),
            from: self.self_id().to_string(),
            to: to.to_string(),
            ts: now_ms(),
            payload,
            sig: None,
        }
    }

    /// Envelope signed over its payload with our private key
    pub fn build_signed(&self, kind: FrameType, to: &str, payload: Value) -> Result<Envelope> {
        let mut envelope = self.build(kind, to, payload);
        envelope.sig = Some(self.identity().keypair.sign(&envelope.payload)?);
        Ok(envelope)
    }

    /// Check an incoming envelope's transport signature.
    ///
    /// The sender's key comes from its live link, then its address record,
    /// then `key_hint` (the key configured for the connection we dialed).
    /// With no key at all only bootstrap types pass.
    pub async fn verify_incoming(
        &self,
        envelope: &Envelope,
        key_hint: Option<&str>,
    ) -> std::result::Result<(), ErrorCode> {
        let known = self.directory.read().await.peer_key(&envelope.from);
        let key = known.or_else(|| key_hint.map(str::to_string));

        let Some(key) = key else {
            return match envelope.frame_type() {
                Some(kind) if kind.is_bootstrap() => Ok(()),
                _ => Err(ErrorCode::UnknownPeerKey),
            };
        };

        let Some(sig) = envelope.sig.as_deref() else {
            return Err(ErrorCode::MissingSig);
        };

        let allow_dummy = self.config().security.dev_allow_dummy_keys;
        if verify_payload(&envelope.payload, sig, &key, allow_dummy) {
            Ok(())
        } else {
            Err(ErrorCode::InvalidSig)
        }
    }

    /// Merge a peer's advertised URL and key into its address record
    pub async fn remember_peer(&self, server_id: &str, url: Option<&str>, pubkey_b64url: Option<&str>) {
        self.directory
            .write()
            .await
            .remember_peer(server_id, url, pubkey_b64url);
    }

    /// Signed `ACK` answering `envelope`
    pub fn ack_for(&self, envelope: &Envelope, status: Option<&str>) -> Result<Envelope> {
        let payload = AckPayload {
            reference: envelope.reference(),
            status: status.map(str::to_string),
        };
        self.build_signed(FrameType::Ack, &envelope.from, serde_json::to_value(payload)?)
    }

    /// Signed `ERROR` answering `envelope`
    pub fn error_for(&self, envelope: &Envelope, code: ErrorCode, detail: &str) -> Result<Envelope> {
        let payload = ErrorPayload {
            reference: envelope.reference(),
            code,
            detail: detail.to_string(),
        };
        self.build_signed(FrameType::Error, &envelope.from, serde_json::to_value(payload)?)
    }
}
