//! Error types and handling for the federation mesh.
//!
//! This module provides a unified error handling system across all components
//! of the mesh node. Wire-level rejections (the `ERROR` envelope codes) live
//! in [`crate::transport::ErrorCode`] and are carried here by
//! [`ProtocolError::Rejected`].

use crate::transport::ErrorCode;
use thiserror::Error;

/// Result type alias for the mesh library
pub type Result<T> = std::result::Result<T, MeshError>;

/// Comprehensive error type for all mesh operations
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Key generation failure
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Signing operation failure
    #[error("Signing failed: {reason}")]
    Signing { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection establishment failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Listener could not be bound
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// Network transport error
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// The link's writer has gone away
    #[error("Link closed: {link_id}")]
    LinkClosed { link_id: u64 },

    /// Peer not found in the link table
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// A frame was refused with a wire error code
    #[error("Frame rejected ({code}): {detail}")]
    Rejected { code: ErrorCode, detail: String },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Missing required message field
    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl MeshError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Shorthand for a [`ProtocolError::Rejected`]
    pub fn rejected<S: Into<String>>(code: ErrorCode, detail: S) -> Self {
        Self::Protocol(ProtocolError::Rejected {
            code,
            detail: detail.into(),
        })
    }

    /// Wire code this error should be reported with, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol(ProtocolError::Rejected { code, .. }) => Some(*code),
            Self::Protocol(ProtocolError::InvalidMessage { .. })
            | Self::Protocol(ProtocolError::MissingField { .. })
            | Self::Protocol(ProtocolError::MessageTooLarge { .. }) => Some(ErrorCode::BadPayload),
            Self::Crypto(CryptoError::SignatureVerification) => Some(ErrorCode::InvalidSig),
            _ => None,
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Network(NetworkError::LinkClosed { .. })
                | Self::Protocol(ProtocolError::Rejected {
                    code: ErrorCode::RateLimit,
                    ..
                })
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Protocol(ProtocolError::Rejected {
                    code: ErrorCode::InvalidSig
                        | ErrorCode::MissingSig
                        | ErrorCode::UnknownPeerKey,
                    ..
                })
        )
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MeshError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(NetworkError::Transport {
            reason: err.to_string(),
        })
    }
}
