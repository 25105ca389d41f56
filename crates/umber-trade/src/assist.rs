//! Process-wide assistive download ticket registry.
//!
//! Two buyers uploading the same work to one seller can share bandwidth:
//! the seller hands one of them a download ticket, and this registry
//! fans the ticket out to the other buyer, which forwards it to its own
//! upload. Everything here is strictly best-effort and in-memory —
//! dropping a ticket is never fatal.
//!
//! Callbacks fire while the registry lock is held and are serialized per
//! node; handlers must not re-enter the registry synchronously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Response header carrying ticket offers from a seller.
pub const ASSIST_TICKET_HEADER: &str = "X-Bitwrk-Assist";

/// Tickets remembered per node for replay to late-joining peers.
const MAX_PENDING_TICKETS: usize = 4;

/// Handler invoked when a ticket should be forwarded to a node's seller.
pub type TicketCallback = Box<dyn Fn(String) + Send + Sync>;

struct TicketNode {
    handprint: String,
    interested: bool,
    callback: TicketCallback,
    /// Tickets this node's seller offered us, kept for peers that join
    /// the same work later.
    offered: Vec<String>,
}

/// Thread-safe map from seller id to its assist node. Clones share the
/// same registry.
#[derive(Clone)]
pub struct TicketRegistry {
    nodes: Arc<Mutex<HashMap<String, TicketNode>>>,
}

impl TicketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a node for `seller` working on the work identified by
    /// `handprint`. Tickets already offered by other sellers for the
    /// same handprint are replayed to the new node immediately.
    pub fn init_node(&self, seller: &str, handprint: &str, callback: TicketCallback) {
        let mut nodes = self.lock();

        let pending: Vec<String> = nodes
            .iter()
            .filter(|(id, node)| id.as_str() != seller && node.handprint == handprint)
            .flat_map(|(_, node)| node.offered.iter().cloned())
            .collect();

        for ticket in &pending {
            callback(ticket.clone());
        }
        tracing::debug!(seller, handprint, replayed = pending.len(), "assist node registered");

        nodes.insert(
            seller.to_string(),
            TicketNode {
                handprint: handprint.to_string(),
                interested: true,
                callback,
                offered: Vec::new(),
            },
        );
    }

    /// Drop the node for `seller`.
    pub fn exit_node(&self, seller: &str) {
        if self.lock().remove(seller).is_some() {
            tracing::debug!(seller, "assist node removed");
        }
    }

    /// Record that `from_seller` offered us `ticket` and fan it out to
    /// every other interested node sharing the same handprint.
    pub fn new_ticket(&self, ticket: &str, from_seller: &str) {
        let mut nodes = self.lock();

        let handprint = match nodes.get_mut(from_seller) {
            Some(node) => {
                if node.offered.len() >= MAX_PENDING_TICKETS {
                    node.offered.remove(0);
                }
                node.offered.push(ticket.to_string());
                node.handprint.clone()
            }
            None => {
                tracing::debug!(from_seller, "ticket from unknown seller dropped");
                return;
            }
        };

        for (id, node) in nodes.iter() {
            if id.as_str() != from_seller && node.handprint == handprint && node.interested {
                (node.callback)(ticket.to_string());
            }
        }
    }

    /// Mark whether the node for `seller` still wants tickets.
    pub fn set_node_interested(&self, seller: &str, interested: bool) {
        if let Some(node) = self.lock().get_mut(seller) {
            node.interested = interested;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TicketNode>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TicketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
