// mkv-common - Shared types and protocol definitions for meshkv
//
// This crate defines the error taxonomy and the binary frame protocol spoken
// between the client and cluster nodes.

pub mod error;
pub mod protocol;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
