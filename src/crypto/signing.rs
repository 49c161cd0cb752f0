//! RSA-PSS transport signatures over canonical payloads.
//!
//! Keys travel as base64url of their PEM text (PKCS#8 for private keys,
//! SPKI for public keys); signatures travel as unpadded base64url. The
//! verification side never errors: every failure collapses to `false`.

use super::canonical::canonical_bytes;
use crate::utils::{CryptoError, Result};
use base64::{engine::general_purpose, Engine};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// PSS salt length in bytes
pub const PSS_SALT_LEN: usize = 32;

/// Stand-in key accepted only when development mode allows it
pub const DUMMY_KEY: &str = "dummy";

/// Encode bytes as unpadded base64url
pub fn to_b64url(bytes: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url, tolerating padding and the standard alphabet
pub fn from_b64url(text: &str) -> Result<Vec<u8>> {
    let normalized: String = text
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    Ok(general_purpose::URL_SAFE_NO_PAD.decode(normalized)?)
}

/// Wrap PEM text for transport
pub fn pem_to_b64url(pem: &str) -> String {
    to_b64url(pem.as_bytes())
}

/// Recover PEM text from its transport form
pub fn pem_from_b64url(text: &str) -> Result<String> {
    String::from_utf8(from_b64url(text)?).map_err(|_| {
        CryptoError::InvalidKey {
            reason: "key material is not UTF-8 PEM text".to_string(),
        }
        .into()
    })
}

/// Encode a private key as base64url PKCS#8 PEM
pub fn encode_private_key(key: &RsaPrivateKey) -> Result<String> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey {
            reason: e.to_string(),
        })?;
    Ok(pem_to_b64url(&pem))
}

/// Encode a public key as base64url SPKI PEM
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey {
            reason: e.to_string(),
        })?;
    Ok(pem_to_b64url(&pem))
}

/// Decode a base64url private key (PKCS#8, falling back to PKCS#1)
pub fn decode_private_key(b64url: &str) -> Result<RsaPrivateKey> {
    let pem = pem_from_b64url(b64url)?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| {
            CryptoError::InvalidKey {
                reason: format!("unreadable private key: {e}"),
            }
            .into()
        })
}

/// Decode a base64url public key (SPKI, falling back to PKCS#1)
pub fn decode_public_key(b64url: &str) -> Result<RsaPublicKey> {
    let pem = pem_from_b64url(b64url)?;
    RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .map_err(|e| {
            CryptoError::InvalidKey {
                reason: format!("unreadable public key: {e}"),
            }
            .into()
        })
}

/// Sign raw bytes with RSA-PSS(SHA-256), returning base64url
pub fn sign_bytes(data: &[u8], key: &RsaPrivateKey) -> Result<String> {
    let digest = Sha256::digest(data);
    let signature = key
        .sign_with_rng(&mut OsRng, Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), &digest)
        .map_err(|e| CryptoError::Signing {
            reason: e.to_string(),
        })?;
    Ok(to_b64url(&signature))
}

/// Sign the canonical form of a payload
pub fn sign_payload(payload: &Value, key: &RsaPrivateKey) -> Result<String> {
    sign_bytes(&canonical_bytes(payload), key)
}

/// Check a base64url signature over raw bytes
pub fn verify_bytes(data: &[u8], signature_b64url: &str, key: &RsaPublicKey) -> bool {
    let Ok(signature) = from_b64url(signature_b64url) else {
        return false;
    };
    let digest = Sha256::digest(data);
    key.verify(
        Pss::new_with_salt::<Sha256>(PSS_SALT_LEN),
        &digest,
        &signature,
    )
    .is_ok()
}

/// Check a signature over the canonical form of a payload.
///
/// `public_key_b64url` is the transport form of the signer's key. With
/// `allow_dummy` set, the [`DUMMY_KEY`] sentinel accepts any signature.
pub fn verify_payload(
    payload: &Value,
    signature_b64url: &str,
    public_key_b64url: &str,
    allow_dummy: bool,
) -> bool {
    if public_key_b64url == DUMMY_KEY {
        return allow_dummy;
    }
    match decode_public_key(public_key_b64url) {
        Ok(key) => verify_bytes(&canonical_bytes(payload), signature_b64url, &key),
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    //! RSA keys are slow to generate; tests share a few.

    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    const TEST_BITS: usize = 1024;

    fn generate() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::rngs::OsRng, TEST_BITS).expect("test key generation")
    }

    /// First shared test key
    pub fn key_a() -> RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(generate).clone()
    }

    /// Second shared test key
    pub fn key_b() -> RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(generate).clone()
    }

    /// Third shared test key
    pub fn key_c() -> RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(generate).clone()
    }
}
