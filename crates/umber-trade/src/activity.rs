//! The per-buy activity record and the paired local-sell handle.
//!
//! All shared state of a buy lives behind one coarse lock; every
//! mutation goes through `exec_sync`, which broadcasts a state-change so
//! that `wait_while` re-evaluates its predicate. Do not shard the lock —
//! the state is small and the waiting contract depends on coarse
//! serialization.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use umber_cafs::File;
use umber_crypto::secret::Secret;
use umber_types::Fingerprint;

use crate::{Result, TradeContext, TradeError};

/// A small state record with broadcast-on-mutate semantics.
pub(crate) struct StateCell<T> {
    state: Mutex<T>,
    version: watch::Sender<u64>,
}

impl<T> StateCell<T> {
    pub(crate) fn new(initial: T) -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(initial),
            version,
        })
    }

    /// Run a mutation under the lock, then wake all waiters.
    pub(crate) fn exec_sync<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.version.send_modify(|v| *v = v.wrapping_add(1));
        result
    }

    /// Run a read under the lock, without waking waiters.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    /// Block until `pred` returns false. The lock is released while
    /// waiting and re-acquired for every re-evaluation.
    pub(crate) async fn wait_while(&self, pred: impl Fn(&T) -> bool) -> Result<()> {
        let mut rx = self.version.subscribe();
        loop {
            if !self.read(&pred) {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| TradeError::Transport("activity state channel closed".to_string()))?;
        }
    }

    /// Like [`StateCell::wait_while`], but ends early with
    /// [`TradeError::Interrupted`] when the interrupt token fires.
    pub(crate) async fn interruptible_wait_while(
        &self,
        interrupt: &CancellationToken,
        pred: impl Fn(&T) -> bool,
    ) -> Result<()> {
        let mut rx = self.version.subscribe();
        loop {
            if !self.read(&pred) {
                return Ok(());
            }
            tokio::select! {
                _ = interrupt.cancelled() => return Err(TradeError::Interrupted),
                changed = rx.changed() => {
                    changed.map_err(|_| {
                        TradeError::Transport("activity state channel closed".to_string())
                    })?;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of the external clearance decision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Clearance {
    /// Pricing/approval still pending.
    #[default]
    Pending,
    /// The buy may proceed.
    Granted,
    /// The buy was refused.
    Denied(String),
}

/// Mutable state of one buy, guarded by the activity's lock.
#[derive(Default)]
pub(crate) struct ActivityState {
    pub alive: bool,
    pub clearance: Clearance,
    pub local_match: Option<Arc<LocalSell>>,
    pub work: Option<File>,
    pub buyer_secret: Option<Secret>,
    pub enc_result: Option<File>,
    pub enc_result_sig: Option<String>,
    pub enc_result_key: Option<Fingerprint>,
    pub result: Option<File>,
    pub bytes_to_transfer: u64,
    pub bytes_transferred: u64,
    pub last_error: Option<String>,
    pub permit: Option<OwnedSemaphorePermit>,
}

struct LocalSellState {
    alive: bool,
    result: Option<File>,
}

/// Handle to a locally matched sell activity: it either publishes a
/// result file or dies without one.
pub struct LocalSell {
    cell: Arc<StateCell<LocalSellState>>,
}

impl LocalSell {
    /// Create a live, resultless sell handle.
    pub fn new() -> Self {
        Self {
            cell: StateCell::new(LocalSellState {
                alive: true,
                result: None,
            }),
        }
    }

    /// Publish the sell's result file.
    pub fn publish_result(&self, file: File) {
        self.cell.exec_sync(|s| s.result = Some(file));
    }

    /// Mark the sell as ended.
    pub fn finish(&self) {
        self.cell.exec_sync(|s| s.alive = false);
    }

    /// Wait until the sell dies or produces a result; returns an owning
    /// duplicate of the result if there is one.
    pub(crate) async fn wait_outcome(
        &self,
        interrupt: &CancellationToken,
    ) -> Result<Option<File>> {
        self.cell
            .interruptible_wait_while(interrupt, |s| s.alive && s.result.is_none())
            .await?;
        Ok(self.cell.read(|s| s.result.as_ref().map(File::duplicate)))
    }
}

impl Default for LocalSell {
    fn default() -> Self {
        Self::new()
    }
}

/// One buy, from clearance to decrypted result.
pub struct BuyActivity {
    pub(crate) ctx: TradeContext,
    pub(crate) tx_id: String,
    pub(crate) shared: Arc<StateCell<ActivityState>>,
}

impl BuyActivity {
    /// Create an activity for an already-matched transaction.
    pub fn new(ctx: TradeContext, tx_id: impl Into<String>) -> Self {
        Self {
            ctx,
            tx_id: tx_id.into(),
            shared: StateCell::new(ActivityState::default()),
        }
    }

    /// The coordinator-assigned transaction id.
    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    /// Clear the buy for execution, optionally binding a local
    /// counter-party sell.
    pub fn grant_clearance(&self, local_match: Option<Arc<LocalSell>>) {
        self.shared.exec_sync(|s| {
            s.clearance = Clearance::Granted;
            s.local_match = local_match;
        });
    }

    /// Refuse the buy.
    pub fn deny_clearance(&self, reason: &str) {
        self.shared
            .exec_sync(|s| s.clearance = Clearance::Denied(reason.to_string()));
    }

    /// Whether the buy is still running (including its finalizer).
    pub fn is_alive(&self) -> bool {
        self.shared.read(|s| s.alive)
    }

    /// Transfer progress: `(bytes_to_transfer, bytes_transferred)`.
    pub fn progress(&self) -> (u64, u64) {
        self.shared.read(|s| (s.bytes_to_transfer, s.bytes_transferred))
    }

    /// The last error recorded by the buy, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.read(|s| s.last_error.clone())
    }

    /// Release every file handle and the transmission permit still held
    /// by the activity record.
    pub fn dispose(&self) {
        self.shared.exec_sync(|s| {
            s.work = None;
            s.enc_result = None;
            s.result = None;
            s.local_match = None;
            s.permit = None;
        });
    }
}
