//! Cooperative shutdown signal.

use tokio::sync::watch;

/// Receiver side of the process shutdown signal.
///
/// In-flight work is allowed to finish; code that is about to start waiting
/// (a backoff sleep, a new reconcile) checks the signal first.
#[derive(Clone, Debug)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown(rx))
    }

    /// A signal that never fires.
    pub fn never() -> Shutdown {
        let (_, rx) = watch::channel(false);
        Shutdown(rx)
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested. Never resolves if the
    /// sender is gone without having signalled.
    pub async fn triggered(&mut self) {
        if self.0.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
