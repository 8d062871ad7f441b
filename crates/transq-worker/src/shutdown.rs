//! Shutdown signalling shared by the worker loop and background tasks.

use std::future::Future;

use tokio::sync::watch;
use tracing::{error, info};

/// Create the shutdown channel. Send `true` to stop.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown was requested or the sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Sleep for `period`, returning early on shutdown. `true` if shutting down.
pub async fn sleep_or_shutdown(period: std::time::Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(rx) => true,
        _ = tokio::time::sleep(period) => false,
    }
}

/// Request shutdown once `signal` resolves.
///
/// If listening for the signal fails, the sender is held until the task is
/// dropped so the worker keeps running instead of stopping at boot.
pub async fn forward_signal<F>(signal: F, tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received shutdown signal");
            let _ = tx.send(true);
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cut_short_by_shutdown() {
        let (tx, mut rx) = channel();
        assert!(!sleep_or_shutdown(Duration::from_secs(1), &mut rx).await);

        tx.send(true).unwrap();
        assert!(sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await);
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = channel();
        drop(tx);
        wait_for_shutdown(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_requests_shutdown() {
        let (tx, mut rx) = channel();
        tokio::spawn(forward_signal(async { Ok(()) }, tx));
        wait_for_shutdown(&mut rx).await;
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_listener_keeps_running() {
        let (tx, mut rx) = channel();
        let listener = tokio::spawn(forward_signal(
            async { Err(std::io::Error::other("no signal handler")) },
            tx,
        ));

        assert!(!sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await);
        assert!(!*rx.borrow());
        assert!(!listener.is_finished());
        listener.abort();
    }
}
