//! Watchdog tying connection scopes to a state predicate.
//!
//! The watchdog watches a state channel; the moment the predicate over
//! the observed state turns false, every registered scope token is
//! cancelled, aborting all I/O that belongs to the expired window.
//! Registrations arriving after the predicate has failed are cancelled
//! immediately. The watchdog exits on its exit token.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Spawn a watchdog over `state`.
///
/// `registrations` delivers scope tokens to guard; `exit` terminates the
/// watchdog (without cancelling anything still legal).
pub fn spawn<T, P>(
    mut state: watch::Receiver<T>,
    exit: CancellationToken,
    mut registrations: mpsc::Receiver<CancellationToken>,
    predicate: P,
) -> tokio::task::JoinHandle<()>
where
    T: Send + Sync + 'static,
    P: Fn(&T) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut scopes: Vec<CancellationToken> = Vec::new();
        let mut failed = false;
        let mut state_open = true;
        let mut registrations_open = true;

        loop {
            if !failed && !predicate(&*state.borrow_and_update()) {
                failed = true;
                tracing::debug!(scopes = scopes.len(), "watchdog fired, closing scopes");
                for scope in scopes.drain(..) {
                    scope.cancel();
                }
            }

            tokio::select! {
                _ = exit.cancelled() => return,
                changed = state.changed(), if state_open => {
                    if changed.is_err() {
                        // State source is gone; whatever phase window the
                        // scopes belonged to cannot be confirmed anymore.
                        state_open = false;
                        if !failed {
                            failed = true;
                            for scope in scopes.drain(..) {
                                scope.cancel();
                            }
                        }
                    }
                }
                registration = registrations.recv(), if registrations_open => {
                    match registration {
                        Some(scope) if failed => scope.cancel(),
                        Some(scope) => scopes.push(scope),
                        None => registrations_open = false,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_scopes_survive_while_predicate_holds() {
        let (state_tx, state_rx) = watch::channel(true);
        let exit = CancellationToken::new();
        let (reg_tx, reg_rx) = mpsc::channel(4);
        let handle = spawn(state_rx, exit.clone(), reg_rx, |ok: &bool| *ok);

        let scope = CancellationToken::new();
        reg_tx.send(scope.clone()).await.expect("register");
        state_tx.send(true).expect("publish");
        settle().await;
        assert!(!scope.is_cancelled());

        exit.cancel();
        handle.await.expect("watchdog exits");
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_predicate_failure_closes_scopes() {
        let (state_tx, state_rx) = watch::channel(true);
        let exit = CancellationToken::new();
        let (reg_tx, reg_rx) = mpsc::channel(4);
        let _handle = spawn(state_rx, exit.clone(), reg_rx, |ok: &bool| *ok);

        let scope = CancellationToken::new();
        reg_tx.send(scope.clone()).await.expect("register");
        settle().await;

        state_tx.send(false).expect("publish");
        settle().await;
        assert!(scope.is_cancelled());
        exit.cancel();
    }

    #[tokio::test]
    async fn test_late_registration_closed_immediately() {
        let (state_tx, state_rx) = watch::channel(true);
        let exit = CancellationToken::new();
        let (reg_tx, reg_rx) = mpsc::channel(4);
        let _handle = spawn(state_rx, exit.clone(), reg_rx, |ok: &bool| *ok);

        state_tx.send(false).expect("publish");
        settle().await;

        let scope = CancellationToken::new();
        reg_tx.send(scope.clone()).await.expect("register");
        settle().await;
        assert!(scope.is_cancelled());
        exit.cancel();
    }

    #[tokio::test]
    async fn test_state_source_gone_counts_as_failure() {
        let (state_tx, state_rx) = watch::channel(true);
        let exit = CancellationToken::new();
        let (reg_tx, reg_rx) = mpsc::channel(4);
        let _handle = spawn(state_rx, exit.clone(), reg_rx, |ok: &bool| *ok);

        let scope = CancellationToken::new();
        reg_tx.send(scope.clone()).await.expect("register");
        settle().await;

        drop(state_tx);
        settle().await;
        assert!(scope.is_cancelled());
        exit.cancel();
    }
}
