//! The buy state machine driver.
//!
//! `perform_buy` carries one buy from clearance to a decrypted result
//! file: a locally matched buy adopts the paired sell's result; a remote
//! buy establishes the transaction with the coordinator, runs the
//! work-transfer sub-protocol, and decrypts the delivered ciphertext.
//! The caller gets the result as soon as it is decrypted; accepting the
//! result towards the coordinator is homework for a background
//! finalizer task.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use umber_cafs::File;
use umber_crypto::secret::Secret;
use umber_crypto::{ofb, sha256};
use umber_types::message::{AcceptResult, EstablishBuyer};
use umber_types::{TxPhase, TxState};

use crate::activity::{ActivityState, BuyActivity, Clearance, LocalSell, StateCell};
use crate::coordinator::{self, TxTracker};
use crate::transfer::{self, TransferEnv};
use crate::{Result, TradeContext, TradeError};

impl BuyActivity {
    /// Manage the complete lifecycle of a buy.
    ///
    /// Aborts at the next suspension point once `interrupt` fires. On
    /// success the returned handle owns the plaintext result.
    pub async fn perform_buy(&self, interrupt: &CancellationToken, work_file: &File) -> Result<File> {
        tracing::info!(tx_id = %self.tx_id, "buy started");
        self.shared.exec_sync(|s| {
            s.alive = true;
            s.work = Some(work_file.duplicate());
        });

        let result = self.do_perform_buy(interrupt).await;
        if let Err(e) = &result {
            self.shared.exec_sync(|s| s.last_error = Some(e.to_string()));
        }
        self.shared.exec_sync(|s| {
            s.work = None;
            s.permit = None;
            s.alive = false;
        });
        tracing::info!(tx_id = %self.tx_id, ok = result.is_ok(), "buy finished");
        result
    }

    /// Wait for clearance, then take the local or the remote path.
    async fn do_perform_buy(&self, interrupt: &CancellationToken) -> Result<File> {
        self.await_clearance(interrupt).await?;

        let local_match = self.shared.read(|s| s.local_match.clone());
        match local_match {
            Some(sell) => self.do_local_buy(interrupt, sell).await,
            None => self.do_remote_buy(interrupt).await,
        }
    }

    /// Block until the external pricing/approval decision lands.
    async fn await_clearance(&self, interrupt: &CancellationToken) -> Result<()> {
        self.shared
            .interruptible_wait_while(interrupt, |s| s.clearance == Clearance::Pending)
            .await?;
        match self.shared.read(|s| s.clearance.clone()) {
            Clearance::Granted => Ok(()),
            Clearance::Denied(reason) => Err(TradeError::ClearanceDenied(reason)),
            Clearance::Pending => Err(TradeError::ClearanceDenied("still pending".to_string())),
        }
    }

    /// Adopt the result of the paired local sell.
    async fn do_local_buy(
        &self,
        interrupt: &CancellationToken,
        sell: Arc<LocalSell>,
    ) -> Result<File> {
        tracing::info!(tx_id = %self.tx_id, "buy matched locally");
        match sell.wait_outcome(interrupt).await? {
            Some(result) => {
                self.shared
                    .exec_sync(|s| s.result = Some(result.duplicate()));
                Ok(result)
            }
            None => Err(TradeError::LocalSellDied),
        }
    }

    /// The remote protocol: establish, transmit, decrypt, finalize.
    async fn do_remote_buy(&self, interrupt: &CancellationToken) -> Result<File> {
        // Admission: at most a configured number of trades may be
        // network-bound at once. The permit is returned by the transfer
        // once the upload is out, or at buy exit at the latest.
        let permit = tokio::select! {
            _ = interrupt.cancelled() => return Err(TradeError::Interrupted),
            permit = self.ctx.admission.clone().acquire_owned() => permit
                .map_err(|_| TradeError::Coordinator("admission closed".to_string()))?,
        };
        self.shared.exec_sync(|s| s.permit = Some(permit));

        let work = self
            .shared
            .read(|s| s.work.as_ref().map(File::duplicate))
            .ok_or_else(|| TradeError::Transport("work file handle missing".to_string()))?;

        let secret = Secret::random();
        let work_hash = work.key();
        let work_secret_hash = sha256::work_secret_hash(&work_hash, &secret);
        self.shared
            .exec_sync(|s| s.buyer_secret = Some(secret.clone()));
        tracing::debug!(tx_id = %self.tx_id, "buyer secret drawn");

        // Poll the transaction for the whole remote phase; the guard
        // stops the poller on every exit path.
        let tracker = TxTracker::new();
        let mut phases = tracker.subscribe();
        let poll_abort = CancellationToken::new();
        let _poll_guard = poll_abort.clone().drop_guard();
        let _poller = coordinator::spawn_poller(
            self.ctx.coordinator.clone(),
            self.tx_id.clone(),
            tracker.clone(),
            poll_abort,
            &self.ctx.config,
        );

        self.ctx
            .coordinator
            .send_establish_buyer(&EstablishBuyer {
                tx_id: self.tx_id.clone(),
                work_hash,
                work_secret_hash,
            })
            .await
            .map_err(|e| e.tag("establishing"))?;

        coordinator::wait_for_phase(
            &mut phases,
            interrupt,
            TxPhase::Transmitting,
            &[
                TxPhase::Establishing,
                TxPhase::BuyerEstablished,
                TxPhase::SellerEstablished,
            ],
        )
        .await
        .map_err(|e| e.tag("establishing"))?;

        // Drive the seller interaction and the phase progression side
        // by side; both must succeed.
        let env = TransferEnv {
            ctx: self.ctx.clone(),
            shared: self.shared.clone(),
            tx_id: self.tx_id.clone(),
            secret,
            tracker: tracker.clone(),
        };
        let outcome = tokio::select! {
            _ = interrupt.cancelled() => return Err(TradeError::Interrupted),
            outcome = async {
                tokio::join!(
                    transfer::interact_with_seller(&env, &work),
                    coordinator::wait_for_phase(
                        &mut phases,
                        interrupt,
                        TxPhase::Unverified,
                        &[TxPhase::Transmitting, TxPhase::Working],
                    ),
                )
            } => outcome,
        };
        match outcome {
            (Ok(()), Ok(())) => {}
            (Err(seller_err), Ok(())) => return Err(seller_err.tag("transmitting")),
            (Ok(()), Err(phase_err)) => return Err(phase_err.tag("transmitting")),
            (Err(seller_err), Err(phase_err)) => {
                return Err(TradeError::Both(
                    Box::new(phase_err.tag("transmitting")),
                    Box::new(seller_err.tag("transmitting")),
                ))
            }
        }

        let enc_result_key = tracker
            .snapshot()
            .tx
            .and_then(|tx| tx.result_decryption_key)
            .ok_or_else(|| {
                TradeError::Coordinator("result decryption key not published".to_string())
            })?;
        self.shared
            .exec_sync(|s| s.enc_result_key = Some(enc_result_key));

        let result = self.decrypt_result().await?;

        // Accepting the result is homework for a background task; the
        // caller gets the plaintext immediately.
        let finalizer = FinalizerEnv {
            ctx: self.ctx.clone(),
            tx_id: self.tx_id.clone(),
            shared: self.shared.clone(),
        };
        let _finalizer = tokio::spawn(async move {
            if let Err(e) = finish_buy(finalizer).await {
                tracing::warn!(error = %e, "buy finalization failed");
            }
        });

        Ok(result)
    }

    /// AES-256-OFB-decrypt the encrypted result into a fresh blob.
    async fn decrypt_result(&self) -> Result<File> {
        let (enc_result, key) = self.shared.read(|s| {
            (
                s.enc_result.as_ref().map(File::duplicate),
                s.enc_result_key,
            )
        });
        let enc_result =
            enc_result.ok_or_else(|| TradeError::Crypto("no encrypted result".to_string()))?;
        let key = key.ok_or_else(|| TradeError::Crypto("no decryption key".to_string()))?;

        let store = self.ctx.store.clone();
        let tx_id = self.tx_id.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<File> {
            let mut temp = store.create(&format!("buy {tx_id}: result"));
            let mut ciphertext = enc_result.open();
            ofb::apply_stream(&key, &mut ciphertext, &mut temp)
                .map_err(|e| TradeError::Crypto(e.to_string()))?;
            temp.close().map_err(|e| TradeError::Crypto(e.to_string()))?;
            temp.file().map_err(|e| TradeError::Crypto(e.to_string()))
        })
        .await
        .map_err(|e| TradeError::Crypto(format!("decrypt task failed: {e}")))??;

        self.shared.exec_sync(|s| {
            s.enc_result = None;
            s.result = Some(result.duplicate());
        });
        tracing::info!(tx_id = %self.tx_id, key = %result.key(), "result decrypted");
        Ok(result)
    }
}

struct FinalizerEnv {
    ctx: TradeContext,
    tx_id: String,
    shared: Arc<StateCell<ActivityState>>,
}

/// Background finalizer: accept the result, wait for the transaction to
/// retire, then let go of the activity. Deliberately not cancellable by
/// the buy's caller.
async fn finish_buy(env: FinalizerEnv) -> Result<()> {
    let tracker = TxTracker::new();
    let mut updates = tracker.subscribe();
    let poll_abort = CancellationToken::new();
    let _poll_guard = poll_abort.clone().drop_guard();
    let _poller = coordinator::spawn_poller(
        env.ctx.coordinator.clone(),
        env.tx_id.clone(),
        tracker.clone(),
        poll_abort,
        &env.ctx.config,
    );

    env.ctx
        .coordinator
        .send_accept_result(&AcceptResult {
            tx_id: env.tx_id.clone(),
        })
        .await
        .map_err(|e| e.tag("accepting"))?;

    loop {
        {
            let view = updates.borrow_and_update();
            match &view.tx {
                Some(tx) if tx.state != TxState::Active => break,
                _ => {}
            }
            if view.poller_gave_up {
                tracing::warn!(tx_id = %env.tx_id, "poller gave up before retirement");
                break;
            }
        }
        if updates.changed().await.is_err() {
            break;
        }
    }

    env.shared.exec_sync(|s| {
        s.result = None;
        s.alive = false;
    });
    tracing::info!(tx_id = %env.tx_id, "buy finalized");
    Ok(())
}
