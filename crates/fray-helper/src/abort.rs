//! Abort notification.
//!
//! One [`AbortHandle`] per run raises the flag; any number of cloned
//! [`AbortNotifier`]s observe it. Aborting never interrupts an operation in
//! flight: the controller checks the notifier between steps and races it
//! against the hold timer, then takes the ordinary revert path.

use tokio::sync::watch;

/// Raises the abort flag.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

/// Observes the abort flag.
#[derive(Debug, Clone)]
pub struct AbortNotifier {
    rx: watch::Receiver<bool>,
}

pub fn abort_channel() -> (AbortHandle, AbortNotifier) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortNotifier { rx })
}

impl AbortHandle {
    pub fn abort(&self) {
        // send_replace works with no live receivers
        let was = self.tx.send_replace(true);
        if !was {
            tracing::warn!("abort requested");
        }
    }

    pub fn notifier(&self) -> AbortNotifier {
        AbortNotifier {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortNotifier {
    /// A notifier that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort is raised. If the handle was dropped without
    /// aborting, this never resolves.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|aborted| *aborted).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Raise abort on SIGINT or SIGTERM.
pub fn spawn_signal_watcher(handle: AbortHandle) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        handle.abort();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notifiers_see_abort() {
        let (handle, notifier) = abort_channel();
        let other = notifier.clone();
        assert!(!notifier.is_aborted());

        let waiter = tokio::spawn(async move { other.aborted().await });
        handle.abort();
        waiter.await.unwrap();
        assert!(notifier.is_aborted());
        assert!(handle.notifier().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_never_fires() {
        let (handle, notifier) = abort_channel();
        drop(handle);
        let fired = tokio::time::timeout(Duration::from_secs(60), notifier.aborted()).await;
        assert!(fired.is_err());
        assert!(!notifier.is_aborted());
    }

    #[tokio::test]
    async fn abort_before_wait_resolves_immediately() {
        let (handle, notifier) = abort_channel();
        handle.abort();
        handle.abort();
        notifier.aborted().await;
    }
}
