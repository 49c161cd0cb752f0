//! Transport layer for the federation mesh.
//!
//! The wire vocabulary and envelope shape live in [`protocol`], the per-peer
//! send handle in [`link`], and the WebSocket listener and dialer in [`ws`].

pub mod link;
pub mod protocol;
pub mod ws;

pub use link::*;
pub use protocol::*;
