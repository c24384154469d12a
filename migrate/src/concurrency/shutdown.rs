use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::bail;
use crate::error::{ErrorKind, MigrateResult};

/// Result of an operation racing against a shutdown request.
#[derive(Debug)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

/// Sending side of the run wide cancellation signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Requests cancellation. Idempotent.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    /// Clears a previous request so the graph can be walked again.
    pub fn rearm(&self) {
        self.0.send_replace(false);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Receiving side of the run wide cancellation signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation has been requested, immediately if it already was.
    pub async fn wait_for_shutdown(&mut self) {
        // A closed sender means the orchestrator is gone, which is treated as a shutdown.
        let _ = self.0.wait_for(|shutdown| *shutdown).await;
    }

    /// Returns an [`ErrorKind::Aborted`] error when cancellation was requested.
    pub fn check(&self) -> MigrateResult<()> {
        if self.is_shutdown() {
            bail!(ErrorKind::Aborted, "Operation was cancelled");
        }

        Ok(())
    }

    /// Sleeps for `duration` unless cancellation is requested first.
    pub async fn sleep(&mut self, duration: Duration) -> ShutdownResult<(), ()> {
        tokio::select! {
            biased;

            _ = self.wait_for_shutdown() => ShutdownResult::Shutdown(()),
            _ = tokio::time::sleep(duration) => ShutdownResult::Ok(()),
        }
    }

    /// Like [`ShutdownRx::sleep`] but reports cancellation as an error.
    pub async fn sleep_or_abort(&mut self, duration: Duration) -> MigrateResult<()> {
        match self.sleep(duration).await {
            ShutdownResult::Ok(()) => Ok(()),
            ShutdownResult::Shutdown(()) => {
                bail!(ErrorKind::Aborted, "Operation was cancelled while waiting")
            }
        }
    }

    /// Drives `future` to completion unless cancellation is requested first.
    pub async fn run_until_shutdown<F>(&mut self, future: F) -> ShutdownResult<F::Output, ()>
    where
        F: Future,
    {
        tokio::select! {
            biased;

            _ = self.wait_for_shutdown() => ShutdownResult::Shutdown(()),
            output = future => ShutdownResult::Ok(output),
        }
    }
}

/// Creates the cancellation channel, initially not signalled.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn sleep_is_interrupted_by_shutdown() {
        let (tx, mut rx) = create_shutdown_channel();

        let started = Instant::now();
        let handle = tokio::spawn(async move { rx.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.shutdown();

        let result = handle.await.unwrap();
        assert!(result.should_shutdown());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn subscribers_see_earlier_shutdown() {
        let (tx, _) = create_shutdown_channel();
        tx.shutdown();

        let mut rx = tx.subscribe();
        assert!(rx.is_shutdown());
        assert_eq!(rx.check().unwrap_err().kind(), ErrorKind::Aborted);
        assert!(rx.sleep(Duration::from_secs(60)).await.should_shutdown());
    }

    #[tokio::test]
    async fn rearm_clears_request() {
        let (tx, rx) = create_shutdown_channel();
        tx.shutdown();
        tx.rearm();

        assert!(!rx.is_shutdown());
        assert!(rx.check().is_ok());
    }
}
