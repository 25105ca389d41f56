//! # umber-types
//!
//! Shared domain types for the Umber compute marketplace: content
//! fingerprints, the transaction document polled from the coordinator,
//! the seller capability probe document, and the signed message forms
//! the buyer sends to the coordinator.

pub mod fingerprint;
pub mod message;
pub mod tx;

pub use fingerprint::Fingerprint;
pub use tx::{Tx, TxPhase, TxState, WorkerCaps};

/// Upper bound on the number of chunks a work file may consist of.
///
/// Work files exceeding this bound cannot be transmitted chunked and are
/// rejected before any sync header is built.
pub const MAX_WORK_FILE_CHUNKS: usize = 16384;
