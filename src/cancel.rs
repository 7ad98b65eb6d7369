//! Job-scoped cancellation.

use tokio::sync::watch;

/// The cancelling side, held by whoever owns the job.
#[derive(Debug)]
pub struct Cancellation {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> Cancellation {
        let (tx, rx) = watch::channel(false);
        Cancellation { tx, rx }
    }

    /// A token to hand to workers.
    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.rx.clone() }
    }

    /// Cancel the job. Every waiter wakes promptly.
    pub fn cancel(&self) {
        // Receivers still exist because we hold one ourselves.
        let _ = self.tx.send(true);
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::new()
    }
}

/// The observing side, cloned into every worker.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the job is cancelled. If the owning `Cancellation` is
    /// dropped without cancelling, this pends forever, which is the right
    /// behavior for a `select!` arm.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let cancellation = Cancellation::new();
        let token = cancellation.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move {
                token.cancelled().await;
            }
        });
        cancellation.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn uncancelled_token_pends() {
        let cancellation = Cancellation::new();
        let token = cancellation.token();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(timed_out.is_err());
    }
}
