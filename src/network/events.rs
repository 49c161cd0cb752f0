//! Events the mesh publishes to the local application layer.

use serde_json::Value;

/// Presence transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// `USER_ADVERTISE`
    Advertised,
    /// `USER_REMOVE`
    Removed,
}

/// Public channel metadata events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicUpdateKind {
    /// `PUBLIC_CHANNEL_ADD`
    Add,
    /// `PUBLIC_CHANNEL_UPDATED`
    Updated,
}

/// File transfer phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePhase {
    /// `FILE_START`
    Start,
    /// `FILE_CHUNK`
    Chunk,
    /// `FILE_END`
    End,
}

/// Everything the local layer can observe
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// An opaque message reached a user hosted here
    UserDelivered {
        /// The `SERVER_DELIVER` payload, untouched
        payload: Value,
    },
    /// A remote server advertised or removed a user
    PresenceChanged {
        /// Advertise or remove
        change: PresenceChange,
        /// Affected user
        user_id: String,
        /// Server that sent the frame
        server_id: String,
        /// Advertised display fields
        meta: Value,
    },
    /// A public channel message, local or remote
    PublicMessageReceived {
        /// The message payload
        payload: Value,
    },
    /// Public channel metadata changed
    PublicUpdateReceived {
        /// Add or update
        kind: PublicUpdateKind,
        /// The metadata payload
        payload: Value,
    },
    /// A wrapped public channel key for a user hosted here
    PublicKeyShareReceived {
        /// The key share payload
        payload: Value,
    },
    /// A file transfer frame for a user hosted here
    FilePhaseReceived {
        /// Which phase
        phase: FilePhase,
        /// The file frame payload
        payload: Value,
    },
    /// A peer acknowledged one of our frames
    AckReceived {
        /// Acknowledging server
        from: String,
        /// `{ref, ...}`
        payload: Value,
    },
    /// A peer reported an error about one of our frames
    ErrorReceived {
        /// Reporting server
        from: String,
        /// `{ref, code, detail}`
        payload: Value,
    },
}

impl MeshEvent {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserDelivered { .. } => "user-delivered",
            Self::PresenceChanged { .. } => "presence-changed",
            Self::PublicMessageReceived { .. } => "public-message-received",
            Self::PublicUpdateReceived { .. } => "public-update-received",
            Self::PublicKeyShareReceived { .. } => "public-key-share-received",
            Self::FilePhaseReceived { .. } => "file-phase-received",
            Self::AckReceived { .. } => "ack-received",
            Self::ErrorReceived { .. } => "error-received",
        }
    }
}
