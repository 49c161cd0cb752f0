//! # Mesh Federation
//!
//! Server-to-server federation for an end-to-end encrypted chat network.
//! Each node keeps WebSocket links to its peers, gossips which server hosts
//! which user, and routes opaque encrypted payloads to the hosting server.
//!
//! ## Features
//!
//! - **Signed envelopes**: RSA-PSS (SHA-256) over canonical JSON payloads
//! - **Inbound gate**: per-connection rate limiting, handshake state, shape
//!   validation and signature checks before any handler runs
//! - **Presence gossip**: last-advertiser-wins user directory with replay
//!   suppression across cyclic topologies
//! - **Routing**: direct delivery, file relay and public-channel fanout
//! - **Liveness**: heartbeats plus eviction and redial of silent peers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mesh_federation::{App, MeshConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::default();
//!     let mut app = App::new(config).await?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: canonical JSON, RSA-PSS signing and the server identity
//! - [`transport`]: envelope vocabulary, link handles and the WebSocket layer
//! - [`network`]: the mesh directory and everything that acts on it
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::App;
pub use crypto::{ServerIdentity, ServerKeyPair};
pub use network::{Mesh, MeshEvent, OpaqueMessage, Routed};
pub use transport::{Envelope, ErrorCode, FrameType};
pub use utils::{MeshConfig, MeshError, Result};

/// Default configuration values
pub mod defaults {
    /// Default port for the mesh listener
    pub const DEFAULT_PORT: u16 = 7081;

    /// Default maximum frame size in bytes (1 MiB)
    pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

    /// Default heartbeat interval in milliseconds
    pub const DEFAULT_HEARTBEAT_MS: u64 = 15_000;

    /// Default silence after which a peer is evicted, in milliseconds
    pub const DEFAULT_PEER_DEAD_MS: u64 = 45_000;

    /// Default replay-suppression window in milliseconds
    pub const DEFAULT_SEEN_TTL_MS: i64 = 90_000;
}
