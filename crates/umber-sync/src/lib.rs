//! # umber-sync
//!
//! The chunk synchronization codec for work transfers.
//!
//! A work blob is described to the receiver as a [`SyncInfo`] header: the
//! ordered list of chunk keys plus a 256-bucket permutation that
//! scrambles the order in which chunk bodies are later emitted. The
//! receiver answers with a [`Wishlist`] bit stream marking the chunks it
//! lacks; the sender then streams exactly those chunk bodies, framed and
//! permuted, through [`codec::write_chunk_data`].
//!
//! ## Modules
//!
//! - [`syncinfo`] — header struct, JSON and legacy-binary serializations,
//!   permutations, handprints.
//! - [`wishlist`] — MSB-first wishlist bit stream.
//! - [`codec`] — permuted, length-framed chunk body encoder/decoder.
//! - [`varint`] — LEB128 unsigned varints used by the framings.

pub mod codec;
pub mod syncinfo;
pub mod varint;
pub mod wishlist;

pub use syncinfo::{ChunkRef, SyncInfo};
pub use wishlist::Wishlist;

/// Error types for sync codec operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// I/O error on the source or sink; fatal to the transfer.
    #[error("I/O error: {0}")]
    Io(String),

    /// Malformed header or frame.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// A received chunk body does not hash to its announced key.
    #[error("chunk {index} does not match its key")]
    ChunkMismatch { index: usize },
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e.to_string())
    }
}

/// Result type alias for sync codec operations.
pub type Result<T> = std::result::Result<T, SyncError>;
