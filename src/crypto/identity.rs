//! Server identity and RSA key management.
//!
//! Each mesh node is identified by a UUID v4 and an RSA key pair. The public
//! half is shared with peers in handshake frames; the private half signs
//! every outbound envelope payload.

use super::signing::{
    decode_private_key, decode_public_key, encode_private_key, encode_public_key, sign_payload,
};
use crate::utils::{CryptoError, Result};
use rand::rngs::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Key size used for freshly generated node identities
pub const DEFAULT_KEY_BITS: usize = 2048;

const IDENTITY_FILE: &str = "identity.json";
const PRIVATE_KEY_FILE: &str = "private_key";

/// RSA key pair for transport signatures
#[derive(Clone)]
pub struct ServerKeyPair {
    /// The private signing key
    private_key: RsaPrivateKey,
    /// Transport form of the public key, cached
    public_b64url: String,
}

impl ServerKeyPair {
    /// Generate a new random key pair
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| CryptoError::KeyGeneration {
                reason: e.to_string(),
            })?;
        Self::from_private_key(private_key)
    }

    /// Wrap an existing private key
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public_b64url = encode_public_key(&RsaPublicKey::from(&private_key))?;
        Ok(Self {
            private_key,
            public_b64url,
        })
    }

    /// Load a key pair from its base64url PEM private key
    pub fn from_private_b64url(b64url: &str) -> Result<Self> {
        Self::from_private_key(decode_private_key(b64url)?)
    }

    /// Public key in transport form
    pub fn public_b64url(&self) -> &str {
        &self.public_b64url
    }

    /// Private key in transport form
    pub fn private_b64url(&self) -> Result<String> {
        encode_private_key(&self.private_key)
    }

    /// Sign a payload value
    pub fn sign(&self, payload: &Value) -> Result<String> {
        sign_payload(payload, &self.private_key)
    }

    /// Short hex fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_b64url)
    }

    /// Check that a configured public key belongs to this private key
    pub fn matches_public(&self, public_b64url: &str) -> Result<bool> {
        let configured = decode_public_key(public_b64url)?;
        Ok(configured == RsaPublicKey::from(&self.private_key))
    }
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Short SHA-256 fingerprint (16 hex chars) of a transport-form public key
pub fn fingerprint_of(public_b64url: &str) -> String {
    let digest = Sha256::digest(public_b64url.as_bytes());
    hex::encode(&digest[..8])
}

/// Public, persistable part of a server identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Server identifier
    pub server_id: Uuid,
    /// Public key in transport form
    pub pubkey_b64url: String,
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A node's identity: its id plus signing keys
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// Unique server identifier
    pub server_id: Uuid,
    /// Signing keys
    pub keypair: ServerKeyPair,
}

impl ServerIdentity {
    /// Create a brand-new identity
    pub fn generate(bits: usize) -> Result<Self> {
        Ok(Self {
            server_id: Uuid::new_v4(),
            keypair: ServerKeyPair::generate(bits)?,
        })
    }

    /// Assemble an identity from existing parts
    pub fn new(server_id: Uuid, keypair: ServerKeyPair) -> Self {
        Self { server_id, keypair }
    }

    /// Server id as it appears in envelope `from` fields
    pub fn id_string(&self) -> String {
        self.server_id.to_string()
    }

    /// Public key in transport form
    pub fn public_b64url(&self) -> &str {
        self.keypair.public_b64url()
    }

    /// Get a short identifier for this identity (first 8 chars of UUID)
    pub fn short_id(&self) -> String {
        self.server_id.to_string()[..8].to_string()
    }

    /// Persist to `identity.json` + `private_key` under `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;

        let record = IdentityRecord {
            server_id: self.server_id,
            pubkey_b64url: self.keypair.public_b64url().to_string(),
            created_at: chrono::Utc::now(),
        };
        fs::write(
            dir.join(IDENTITY_FILE),
            serde_json::to_string_pretty(&record)?,
        )?;
        fs::write(dir.join(PRIVATE_KEY_FILE), self.keypair.private_b64url()?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.join(PRIVATE_KEY_FILE), fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load a previously saved identity; `None` if nothing is stored
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let record_path = dir.join(IDENTITY_FILE);
        let key_path = dir.join(PRIVATE_KEY_FILE);
        if !record_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let record: IdentityRecord = serde_json::from_str(&fs::read_to_string(record_path)?)?;
        let keypair = ServerKeyPair::from_private_b64url(fs::read_to_string(key_path)?.trim())?;

        if keypair.public_b64url() != record.pubkey_b64url
            && !keypair.matches_public(&record.pubkey_b64url)?
        {
            return Err(CryptoError::InvalidKey {
                reason: "Stored private key and identity public key don't match".to_string(),
            }
            .into());
        }

        Ok(Some(Self::new(record.server_id, keypair)))
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short_id(), self.keypair.fingerprint())
    }
}

#[cfg(test)]
pub(crate) fn test_identity() -> ServerIdentity {
    use super::signing::test_keys::key_a;
    ServerIdentity::new(
        Uuid::new_v4(),
        ServerKeyPair::from_private_key(key_a()).expect("test keypair"),
    )
}
