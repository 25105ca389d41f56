//! Message forms the buyer sends to the coordinator.
//!
//! Each message serializes to a canonical `key=value&...` form body. The
//! caller signs exactly those bytes and appends `address` and `signature`
//! fields before posting; keeping every value hex or plain ASCII means
//! the canonical body needs no percent-encoding.

use crate::Fingerprint;

/// Deposits the buyer's work hash and work-secret hash, committing the
/// buyer to the transaction.
#[derive(Clone, Debug)]
pub struct EstablishBuyer {
    /// Coordinator-assigned transaction id.
    pub tx_id: String,
    /// Key of the work blob.
    pub work_hash: Fingerprint,
    /// SHA-256 over work hash and buyer secret.
    pub work_secret_hash: Fingerprint,
}

/// Tells the coordinator the buyer accepts the delivered result.
#[derive(Clone, Debug)]
pub struct AcceptResult {
    /// Coordinator-assigned transaction id.
    pub tx_id: String,
}

impl EstablishBuyer {
    /// Canonical form body, the byte string that gets signed.
    pub fn canonical_form(&self) -> String {
        format!(
            "txid={}&workhash={}&worksecrethash={}",
            self.tx_id, self.work_hash, self.work_secret_hash
        )
    }
}

impl AcceptResult {
    /// Canonical form body, the byte string that gets signed.
    pub fn canonical_form(&self) -> String {
        format!("txid={}", self.tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_establish_buyer_canonical_form() {
        let msg = EstablishBuyer {
            tx_id: "tx-42".to_string(),
            work_hash: Fingerprint::from_bytes([0x11; 32]),
            work_secret_hash: Fingerprint::from_bytes([0x22; 32]),
        };
        assert_eq!(
            msg.canonical_form(),
            format!("txid=tx-42&workhash={}&worksecrethash={}", "11".repeat(32), "22".repeat(32))
        );
    }

    #[test]
    fn test_accept_result_canonical_form() {
        let msg = AcceptResult {
            tx_id: "tx-7".to_string(),
        };
        assert_eq!(msg.canonical_form(), "txid=tx-7");
    }
}
