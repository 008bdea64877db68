use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::deferred::DeferredClaimer;

/// Periodic sweep of all deferring symbols, stopped through [`SweepSchedule::shutdown`].
pub struct SweepSchedule {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweepSchedule {
    /// Fails for a zero `interval`.
    pub fn spawn(claimer: Arc<DeferredClaimer>, interval: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(!interval.is_zero(), "batch claim interval must not be zero");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; startup recovery already swept.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let claimed = claimer.sweep().await;
                        if !claimed.is_empty() {
                            tracing::info!(?claimed, "scheduled sweep claimed swaps");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::debug!("stopping sweep schedule");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            shutdown_tx,
            handle,
        })
    }

    /// Stops the schedule; an in-flight sweep finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            tracing::warn!(error = %err, "sweep schedule join error");
        }
    }
}
