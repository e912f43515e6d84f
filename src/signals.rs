use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::watch;

/// Watches for SIGINT/SIGTERM on a dedicated thread. The returned receiver
/// flips to `true` on the first one; in-flight requests are left to finish.
pub fn shutdown_on_signal() -> std::io::Result<watch::Receiver<bool>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = watch::channel(false);

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = tx.send(true);
        }
    });

    Ok(rx)
}

/// Resolves once `rx` reports shutdown, or when its sender is gone.
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_shutdown(rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
