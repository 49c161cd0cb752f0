//! Cryptographic primitives and identity management.
//!
//! Canonical JSON encoding, RSA-PSS transport signatures and the node's
//! server identity.

pub mod canonical;
pub mod identity;
pub mod signing;

pub use canonical::{canonical_bytes, canonicalize, canonicalize_serializable};
pub use identity::*;
pub use signing::{from_b64url, sign_payload, to_b64url, verify_payload, DUMMY_KEY};
