use std::time::Duration;

use pik_ledger::Store;
use tokio::task::JoinHandle;

/// Periodic sweep of expired WebAuthn challenges and session tokens. The
/// first tick fires immediately at startup; a failed sweep is logged and
/// retried on the next tick.
pub fn spawn(store: Store, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.delete_expired().await {
                Ok((challenges, tokens)) => {
                    if challenges > 0 || tokens > 0 {
                        tracing::info!(challenges, tokens, "reaper.swept");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "reaper.sweep_failed");
                }
            }
        }
    })
}
