//! # umber-cafs
//!
//! In-memory content-addressed file store.
//!
//! Blobs are keyed by their SHA-256 digest; identical content
//! deduplicates. Content is sliced into variable-length chunks by a
//! rolling-hash boundary function, so the chunk layout of a blob is
//! stable across insertions and shifts — the property the chunked work
//! transfer relies on to skip chunks the receiver already has.
//!
//! ## Modules
//!
//! - [`chunker`] — rolling-hash content-defined chunk splitting.
//! - [`store`] — [`Store`], owning [`File`] handles, [`Temp`] sinks.

pub mod chunker;
pub mod store;

pub use store::{Chunk, File, Store, Temp};

/// Error types for store operations.
#[derive(Debug, thiserror::Error)]
pub enum CafsError {
    /// No blob with the given key.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Operation on a temp that was already closed or disposed.
    #[error("temp is not open: {0}")]
    TempNotOpen(String),

    /// Operation requiring a closed temp.
    #[error("temp is not closed: {0}")]
    TempNotClosed(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, CafsError>;
