//! Coordinator messaging, transaction polling and phase waits.
//!
//! The coordinator advances the transaction; the buyer reacts. A poller
//! task periodically fetches the transaction document and publishes
//! snapshots through a [`TxTracker`]; [`wait_for_phase`] observes every
//! snapshot and enforces that the transaction only ever moves through
//! the phases the caller declared legal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use umber_crypto::identity::Identity;
use umber_types::message::{AcceptResult, EstablishBuyer};
use umber_types::{Tx, TxPhase, TxState};

use crate::{Result, TradeConfig, TradeError};

/// Ceiling for the poller's error backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What the buyer currently knows about its transaction.
#[derive(Clone, Debug, Default)]
pub struct TxView {
    /// Latest transaction snapshot, if any poll has succeeded.
    pub tx: Option<Tx>,
    /// Set when the poller has given up; no further snapshots follow.
    pub poller_gave_up: bool,
}

/// Publishes transaction snapshots to any number of observers.
pub struct TxTracker {
    sender: watch::Sender<TxView>,
}

impl TxTracker {
    /// Create a tracker with an empty initial view.
    pub fn new() -> Arc<Self> {
        let (sender, _) = watch::channel(TxView::default());
        Arc::new(Self { sender })
    }

    /// Publish a fresh snapshot.
    pub fn publish(&self, tx: Tx) {
        self.sender.send_modify(|view| view.tx = Some(tx));
    }

    /// Mark the poller as dead; observers fail their waits.
    pub fn mark_gave_up(&self) {
        self.sender.send_modify(|view| view.poller_gave_up = true);
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<TxView> {
        self.sender.subscribe()
    }

    /// The current view.
    pub fn snapshot(&self) -> TxView {
        self.sender.borrow().clone()
    }
}

/// Client for the coordinating authority. All message bodies are signed
/// with the buyer's identity.
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
    identity: Arc<Identity>,
}

impl CoordinatorClient {
    /// Build a client from the engine configuration.
    pub fn new(config: &TradeConfig, identity: Arc<Identity>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TradeError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: config.coordinator_url.trim_end_matches('/').to_string(),
            http,
            identity,
        })
    }

    /// Deposit the buyer's work hash and work-secret hash.
    pub async fn send_establish_buyer(&self, msg: &EstablishBuyer) -> Result<()> {
        self.post_signed(&msg.tx_id, msg.canonical_form()).await
    }

    /// Accept the delivered result.
    pub async fn send_accept_result(&self, msg: &AcceptResult) -> Result<()> {
        self.post_signed(&msg.tx_id, msg.canonical_form()).await
    }

    /// Fetch the current transaction document.
    pub async fn query_tx(&self, tx_id: &str) -> Result<Tx> {
        let url = format!("{}/tx/{}", self.base_url, tx_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TradeError::Coordinator(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TradeError::Coordinator(format!(
                "transaction query returned status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TradeError::Coordinator(e.to_string()))?;
        serde_json::from_slice(&body)
            .map_err(|e| TradeError::Coordinator(format!("malformed transaction document: {e}")))
    }

    async fn post_signed(&self, tx_id: &str, canonical: String) -> Result<()> {
        let signature = self.identity.sign(canonical.as_bytes());
        let body = format!(
            "{canonical}&address={}&signature={signature}",
            self.identity.address()
        );

        let url = format!("{}/tx/{}", self.base_url, tx_id);
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| TradeError::Coordinator(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TradeError::Coordinator(format!(
                "coordinator rejected message with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Spawn a poller that keeps `tracker` fresh until `abort` fires.
///
/// Poll failures back off exponentially; after `poll_max_failures`
/// consecutive failures the poller marks the tracker dead and exits.
pub fn spawn_poller(
    client: Arc<CoordinatorClient>,
    tx_id: String,
    tracker: Arc<TxTracker>,
    abort: CancellationToken,
    config: &TradeConfig,
) -> tokio::task::JoinHandle<()> {
    let base_interval = Duration::from_millis(config.poll_interval_ms);
    let max_failures = config.poll_max_failures;

    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            match client.query_tx(&tx_id).await {
                Ok(tx) => {
                    failures = 0;
                    tracing::debug!(tx_id = %tx_id, phase = %tx.phase, "transaction polled");
                    tracker.publish(tx);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(tx_id = %tx_id, failures, error = %e, "transaction poll failed");
                    if failures >= max_failures {
                        tracker.mark_gave_up();
                        return;
                    }
                }
            }

            let delay = if failures == 0 {
                base_interval
            } else {
                (base_interval * 2u32.saturating_pow(failures)).min(MAX_BACKOFF)
            };
            tokio::select! {
                _ = abort.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    })
}

/// Block until the transaction reaches `target`.
///
/// Every observed snapshot is checked: phases outside
/// `{target} ∪ transient` fail with [`TradeError::PhaseViolation`],
/// which catches both backward and skipped transitions. A transaction
/// leaving the active state, a dead poller, or the interrupt token all
/// end the wait.
pub async fn wait_for_phase(
    rx: &mut watch::Receiver<TxView>,
    interrupt: &CancellationToken,
    target: TxPhase,
    transient: &[TxPhase],
) -> Result<()> {
    loop {
        {
            let view = rx.borrow_and_update();
            if let Some(tx) = &view.tx {
                if tx.phase == target {
                    return Ok(());
                }
                if tx.state != TxState::Active {
                    return Err(TradeError::Coordinator(format!(
                        "transaction retired in phase {}",
                        tx.phase
                    )));
                }
                if !transient.contains(&tx.phase) {
                    return Err(TradeError::PhaseViolation {
                        observed: tx.phase.to_string(),
                        allowed: allowed_set(target, transient),
                    });
                }
            }
            if view.poller_gave_up {
                return Err(TradeError::Coordinator(
                    "transaction poller gave up".to_string(),
                ));
            }
        }

        tokio::select! {
            _ = interrupt.cancelled() => return Err(TradeError::Interrupted),
            changed = rx.changed() => {
                changed.map_err(|_| {
                    TradeError::Coordinator("transaction tracker closed".to_string())
                })?;
            }
        }
    }
}

fn allowed_set(target: TxPhase, transient: &[TxPhase]) -> String {
    let mut names: Vec<String> = transient.iter().map(|p| p.to_string()).collect();
    names.push(target.to_string());
    names.join(", ")
}
