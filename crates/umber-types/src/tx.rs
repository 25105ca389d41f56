//! The transaction document polled from the coordinator, and the seller
//! capability probe document.
//!
//! The coordinator owns the transaction; the buyer only ever observes
//! snapshots of it. Phases advance monotonically along the protocol DAG,
//! in the declaration order of [`TxPhase`] — the buyer never accepts a
//! backward transition.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Fingerprint;

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    /// The transaction is live; messages are still accepted.
    #[serde(rename = "ACTIVE")]
    Active,
    /// The transaction has been settled or abandoned.
    #[serde(rename = "RETIRED")]
    Retired,
}

/// Protocol phase of a transaction.
///
/// Declaration order is DAG order; the derived `Ord` reflects how far the
/// exchange has progressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxPhase {
    /// Freshly matched; neither party has committed yet.
    Establishing,
    /// The buyer has deposited its work hash and secret hash.
    BuyerEstablished,
    /// The seller has published its worker endpoint.
    SellerEstablished,
    /// Both parties committed; work data may flow to the seller.
    Transmitting,
    /// The seller is executing the work.
    Working,
    /// The encrypted result has been delivered, receipt not yet verified.
    Unverified,
    /// The coordinator is checking the receipt.
    Verifying,
    /// Terminal phase.
    Finished,
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxPhase::Establishing => "ESTABLISHING",
            TxPhase::BuyerEstablished => "BUYER_ESTABLISHED",
            TxPhase::SellerEstablished => "SELLER_ESTABLISHED",
            TxPhase::Transmitting => "TRANSMITTING",
            TxPhase::Working => "WORKING",
            TxPhase::Unverified => "UNVERIFIED",
            TxPhase::Verifying => "VERIFYING",
            TxPhase::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Snapshot of a transaction as returned by the coordinator's polling
/// endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    /// Lifecycle state.
    pub state: TxState,
    /// Current protocol phase.
    pub phase: TxPhase,
    /// HTTPS endpoint of the seller's worker, available once the seller
    /// has established.
    #[serde(rename = "workerURL", default)]
    pub worker_url: Option<String>,
    /// Opaque seller identity string.
    #[serde(default)]
    pub seller: String,
    /// Key unlocking the encrypted result; published by the coordinator
    /// only after the buyer has signed the receipt.
    #[serde(default)]
    pub result_decryption_key: Option<Fingerprint>,
}

/// Capabilities advertised by a seller's worker in response to an
/// `OPTIONS` probe. Absent or malformed answers read as all-false.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCaps {
    /// Worker can receive work as content-defined chunks.
    #[serde(rename = "Adler32Chunking")]
    pub adler32_chunking: bool,
    /// Worker accepts gzip-compressed request bodies.
    #[serde(rename = "GZIPCompression")]
    pub gzip_compression: bool,
    /// Worker understands the permuted sync-info header.
    #[serde(rename = "SyncInfo")]
    pub sync_info: bool,
}
