//! # umber-trade
//!
//! The buyer-side trade engine of the Umber compute marketplace.
//!
//! A buyer holds a work blob and wants the result blob a seller produces
//! by running the agreed worker program over it. This crate drives the
//! buyer through the whole exchange: waiting for clearance, choosing a
//! locally matched sell over the network path, establishing the
//! transaction with the coordinator, transmitting the work to the seller
//! (linearly or as content-addressed chunks in permuted order), capturing
//! the encrypted result, signing the receipt, and decrypting.
//!
//! ## Modules
//!
//! - [`activity`] — the per-buy record behind one coarse lock, plus the
//!   paired local-sell handle.
//! - [`buy`] — the buy state machine driver.
//! - [`transfer`] — the work-transfer sub-protocol against the seller.
//! - [`coordinator`] — signed coordinator messages, transaction polling
//!   and phase waits.
//! - [`watchdog`] — closes connection scopes when the transaction leaves
//!   its legal phase window.
//! - [`scope`] — an HTTP client whose in-flight requests die together.
//! - [`assist`] — the process-wide assistive download ticket registry.
//! - [`pipe`], [`multipart`], [`gzip`] — streaming request-body plumbing.
//! - [`config`] — engine configuration.

pub mod activity;
pub mod assist;
pub mod buy;
pub mod config;
pub mod coordinator;
pub mod gzip;
pub mod multipart;
pub mod pipe;
pub mod scope;
pub mod transfer;
pub mod watchdog;

use std::sync::Arc;

use tokio::sync::Semaphore;

pub use activity::{BuyActivity, LocalSell};
pub use config::TradeConfig;

/// Error types for trade operations, each surfaced once at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum TradeError {
    /// The caller or scheduler requested an abort.
    #[error("interrupted")]
    Interrupted,

    /// Pricing or policy refused the buy.
    #[error("clearance denied: {0}")]
    ClearanceDenied(String),

    /// The paired local sell ended without producing a result.
    #[error("local sell ended without a result")]
    LocalSellDied,

    /// Network or authentication failure talking to the coordinator, or
    /// the transaction left the active state.
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// An observed transaction phase was outside the allowed set.
    #[error("phase violation: observed {observed}, allowed {allowed}")]
    PhaseViolation { observed: String, allowed: String },

    /// The seller broke the worker protocol (bad status, malformed
    /// documents, rejected receipt).
    #[error("seller protocol error: {0}")]
    SellerProtocol(String),

    /// Raw I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Decryption pipeline failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The work file exceeds the chunk-count bound.
    #[error("work file too large: {chunks} chunks (limit {limit})")]
    WorkTooLarge { chunks: usize, limit: usize },

    /// A lower-level error wrapped with a short phase tag.
    #[error("{tag}: {source}")]
    Tagged {
        tag: &'static str,
        #[source]
        source: Box<TradeError>,
    },

    /// Peer interaction and phase wait failed simultaneously.
    #[error("{0}; additionally: {1}")]
    Both(Box<TradeError>, Box<TradeError>),
}

impl TradeError {
    /// Wrap with a phase tag. Interrupts stay unwrapped so callers can
    /// always match them directly.
    pub fn tag(self, tag: &'static str) -> Self {
        match self {
            TradeError::Interrupted => TradeError::Interrupted,
            other => TradeError::Tagged {
                tag,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error is an interrupt, at any wrapping depth.
    pub fn is_interrupted(&self) -> bool {
        match self {
            TradeError::Interrupted => true,
            TradeError::Tagged { source, .. } => source.is_interrupted(),
            TradeError::Both(a, b) => a.is_interrupted() || b.is_interrupted(),
            _ => false,
        }
    }
}

/// Result type alias for trade operations.
pub type Result<T> = std::result::Result<T, TradeError>;

/// Everything a buy activity needs from its environment. Handed out by
/// the external scheduler; clones share the underlying services.
#[derive(Clone)]
pub struct TradeContext {
    /// The content-addressed store holding work and result blobs.
    pub store: umber_cafs::Store,
    /// Client for the coordinating authority.
    pub coordinator: Arc<coordinator::CoordinatorClient>,
    /// The buyer's signing identity.
    pub identity: Arc<umber_crypto::identity::Identity>,
    /// Process-wide assistive download ticket registry.
    pub tickets: assist::TicketRegistry,
    /// Admission bound on concurrent network transmissions.
    pub admission: Arc<Semaphore>,
    /// Engine configuration.
    pub config: TradeConfig,
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A context wired to nothing, for unit tests that never touch the
    /// network.
    pub fn context() -> TradeContext {
        let config = TradeConfig::default();
        let identity = Arc::new(umber_crypto::identity::Identity::generate());
        let coordinator = Arc::new(
            coordinator::CoordinatorClient::new(&config, identity.clone()).expect("client"),
        );
        TradeContext {
            store: umber_cafs::Store::new(),
            coordinator,
            identity,
            tickets: assist::TicketRegistry::new(),
            admission: Arc::new(Semaphore::new(config.max_transmissions)),
            config,
        }
    }
}
